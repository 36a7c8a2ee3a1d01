use jobq_core::CoreError;
use jobq_process::ProcessError;
use jobq_scheduler::QueueError;
use thiserror::Error;

/// Faults of the runner itself. A job that fails is not one of them.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<CoreError> for RunnerError {
    fn from(e: CoreError) -> Self {
        RunnerError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
