use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned job identity. Ids grow with insertion order, which makes
/// them the FIFO tie-break between jobs of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl JobId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(JobId)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Inserted, but not yet confirmed. Never started from here.
    New,
    /// Confirmed and waiting. Only startable once every dependency finished.
    Pending,
    /// Never started, and never will be.
    Canceled,
    /// Started and not yet exited.
    Running,
    /// Exited with the success exit code.
    Finished,
    /// Exited with any other exit code.
    Failed,
    /// Killed after exceeding its `max_runtime`.
    Terminated,
    /// The runner itself failed while supervising the job.
    Incomplete,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::New,
        JobState::Pending,
        JobState::Canceled,
        JobState::Running,
        JobState::Finished,
        JobState::Failed,
        JobState::Terminated,
        JobState::Incomplete,
    ];

    /// Legal targets when leaving this state. Empty for final states.
    pub fn allowed_transitions(self) -> &'static [JobState] {
        match self {
            JobState::New => &[JobState::Pending, JobState::Canceled],
            JobState::Pending => &[JobState::Running, JobState::Canceled],
            JobState::Running => &[
                JobState::Finished,
                JobState::Failed,
                JobState::Terminated,
                JobState::Incomplete,
            ],
            JobState::Canceled
            | JobState::Finished
            | JobState::Failed
            | JobState::Terminated
            | JobState::Incomplete => &[],
        }
    }

    /// Anything that is neither new, pending nor running.
    pub fn is_final(self) -> bool {
        !matches!(self, JobState::New | JobState::Pending | JobState::Running)
    }

    /// Final states that block dependents forever.
    pub fn is_non_successful_final(self) -> bool {
        matches!(
            self,
            JobState::Canceled | JobState::Failed | JobState::Incomplete | JobState::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Pending => "pending",
            JobState::Canceled => "canceled",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Terminated => "terminated",
            JobState::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// Id plus last known state of another job (a dependency or a retry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: JobId,
    pub state: JobState,
}

/// Reference to a record outside the queue, e.g. `("invoice", "42")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedEntity {
    /// Type tag of the external record.
    pub kind: String,
    /// External identifier, opaque to the queue.
    pub id: String,
}

impl RelatedEntity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RelatedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Captured runner-side failure, stored as a JSON blob in `jobs.stack_trace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub message: String,
    /// `source()` chain of the error, outermost first.
    #[serde(default)]
    pub causes: Vec<String>,
}

impl StackTrace {
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            causes,
        }
    }
}

/// Logical notification pushed for every applied state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub job_id: JobId,
    pub command: String,
    pub new_state: JobState,
}

/// Narrowing applied on top of "pending, unclaimed, due" when selecting jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub excluded_commands: Vec<String>,
    /// Typically the queues that reached their concurrency limit.
    pub excluded_queues: Vec<String>,
    /// When non-empty, only these queues are considered.
    pub restricted_queues: Vec<String>,
}
