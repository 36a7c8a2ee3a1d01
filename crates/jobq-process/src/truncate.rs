//! Shortening captured job output before it is written to the log.
//!
//! The stored output is never truncated; only what goes through `tracing`.

/// Shorten `output` to at most `max_chars` characters by cutting out its
/// middle, so both the first lines (what the command was doing) and the last
/// lines (how it ended) survive:
///
/// ```text
/// <first max_chars/2 chars> ... [N chars omitted] ... <last max_chars/2 chars>
/// ```
///
/// Counts characters, not bytes, so multi-byte sequences are never split.
pub fn truncate_middle(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head} ... [{omitted} chars omitted] ... {tail}")
}

/// Remove terminal escape sequences so colored job output stays readable in
/// log files.
pub fn strip_ansi(raw: &str) -> String {
    let clean = strip_ansi_escapes::strip(raw.as_bytes());
    String::from_utf8_lossy(&clean).into_owned()
}
