//! Error types for the jobq-process crate.

use thiserror::Error;

/// Failures of the supervisor itself, never of the supervised command.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The child could not be started (missing binary, permissions, fd limits).
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Waiting on the child or reading its pipes failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `kill(2)` was rejected for a reason other than the child being gone.
    #[error("could not signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ProcessError>;
