//! Stamps the binary with the source revision shown by `jobq --version`.
//!
//! Release tarballs carry no `.git`; packagers pass the revision in
//! `JOBQ_GIT_SHA` instead.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=JOBQ_GIT_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");

    let revision = std::env::var("JOBQ_GIT_SHA")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(git_revision)
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=JOBQ_GIT_SHA={}", revision.trim());
}

/// `git describe`, marked `-dirty` when the work tree has local edits.
fn git_revision() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
