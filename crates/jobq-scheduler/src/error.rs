use thiserror::Error;

use crate::types::JobState;

/// Errors that can occur within the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The state machine does not allow `current -> target`.
    ///
    /// `allowed` lists the legal targets; it is empty when `current` is final.
    #[error("{job}: cannot transition from \"{current}\" to \"{target}\" (allowed: {})", format_states(.allowed))]
    InvalidStateTransition {
        job: String,
        current: JobState,
        target: JobState,
        allowed: Vec<JobState>,
    },

    /// No job matched the lookup.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A call that violates the job contract, e.g. adding a dependency to a
    /// job that might already have started.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A constructor argument is out of range (empty queue, overlong command).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored row could not be mapped back to a job.
    #[error("Corrupt job record: {0}")]
    CorruptRecord(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_states(states: &[JobState]) -> String {
    if states.is_empty() {
        return "none".to_string();
    }
    states
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, QueueError>;
