//! The `Job` entity and its state machine.
//!
//! All state changes go through [`Job::set_state`]; the store only ever
//! persists what the entity already accepted.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{QueueError, Result},
    types::{JobId, JobRef, JobState, RelatedEntity, StackTrace},
};

pub const DEFAULT_QUEUE: &str = "default";
pub const MAX_QUEUE_LENGTH: usize = 50;

pub const PRIORITY_LOW: i16 = -5;
pub const PRIORITY_DEFAULT: i16 = 0;
pub const PRIORITY_HIGH: i16 = 5;

/// A unit of work: a command plus its arguments, and everything the queue
/// tracks about running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub(crate) id: Option<JobId>,
    pub(crate) state: JobState,
    pub(crate) queue: String,
    /// Public value; higher runs first. The store keeps it negated.
    pub(crate) priority: i16,
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) execute_after: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) checked_at: Option<DateTime<Utc>>,
    pub(crate) closed_at: Option<DateTime<Utc>>,
    pub(crate) worker_name: Option<String>,
    pub(crate) dependencies: Vec<JobRef>,
    pub(crate) output: Option<String>,
    pub(crate) error_output: Option<String>,
    pub(crate) exit_code: Option<i32>,
    /// Seconds; 0 means unbounded.
    pub(crate) max_runtime: u32,
    pub(crate) max_retries: u32,
    pub(crate) original_job: Option<JobId>,
    pub(crate) retry_jobs: Vec<JobRef>,
    pub(crate) stack_trace: Option<StackTrace>,
    /// Seconds of wall-clock time.
    pub(crate) runtime: Option<u32>,
    pub(crate) memory_usage: Option<u64>,
    pub(crate) memory_usage_real: Option<u64>,
    pub(crate) related_entities: Vec<RelatedEntity>,
}

impl Job {
    /// Confirmed job on the default queue with default priority.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::build(
            command.into(),
            args,
            JobState::Pending,
            DEFAULT_QUEUE.to_string(),
            PRIORITY_DEFAULT,
        )
    }

    /// Full constructor. An unconfirmed job starts in `new` and is never
    /// selected until it is moved to `pending`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: `queue` is blank or longer than [`MAX_QUEUE_LENGTH`].
    pub fn create(
        command: impl Into<String>,
        args: Vec<String>,
        confirmed: bool,
        queue: impl Into<String>,
        priority: i16,
    ) -> Result<Self> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "queue must not be empty".to_string(),
            ));
        }
        if queue.len() > MAX_QUEUE_LENGTH {
            return Err(QueueError::InvalidArgument(format!(
                "the maximum queue length is {MAX_QUEUE_LENGTH}, but got \"{queue}\" ({} chars)",
                queue.len()
            )));
        }
        let state = if confirmed {
            JobState::Pending
        } else {
            JobState::New
        };
        Ok(Self::build(command.into(), args, state, queue, priority))
    }

    fn build(
        command: String,
        args: Vec<String>,
        state: JobState,
        queue: String,
        priority: i16,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            state,
            queue,
            priority,
            command,
            args,
            created_at: now,
            // One second in the past so a fresh job is due immediately.
            execute_after: now - Duration::seconds(1),
            started_at: None,
            checked_at: None,
            closed_at: None,
            worker_name: None,
            dependencies: Vec::new(),
            output: None,
            error_output: None,
            exit_code: None,
            max_runtime: 0,
            max_retries: 0,
            original_job: None,
            retry_jobs: Vec::new(),
            stack_trace: None,
            runtime: None,
            memory_usage: None,
            memory_usage_real: None,
            related_entities: Vec::new(),
        }
    }

    /// Fresh copy used as a retry: same work, same limits, same
    /// dependencies; state back to `pending` and every execution field empty.
    pub fn clone_for_retry(&self) -> Self {
        let mut retry = Self::build(
            self.command.clone(),
            self.args.clone(),
            JobState::Pending,
            self.queue.clone(),
            self.priority,
        );
        retry.max_runtime = self.max_runtime;
        retry.max_retries = self.max_retries;
        retry.dependencies = self.dependencies.clone();
        retry
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn execute_after(&self) -> DateTime<Utc> {
        self.execute_after
    }

    pub fn set_execute_after(&mut self, at: DateTime<Utc>) {
        self.execute_after = at;
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn checked_at(&self) -> Option<DateTime<Utc>> {
        self.checked_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    pub fn max_runtime(&self) -> u32 {
        self.max_runtime
    }

    pub fn set_max_runtime(&mut self, secs: u32) {
        self.max_runtime = secs;
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn set_max_retries(&mut self, retries: u32) {
        self.max_retries = retries;
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    pub fn runtime(&self) -> Option<u32> {
        self.runtime
    }

    pub fn set_runtime(&mut self, secs: u32) {
        self.runtime = Some(secs);
    }

    pub fn memory_usage(&self) -> Option<u64> {
        self.memory_usage
    }

    pub fn memory_usage_real(&self) -> Option<u64> {
        self.memory_usage_real
    }

    /// Record peak resident and peak virtual memory, in bytes.
    pub fn set_memory_usage(&mut self, peak: u64, peak_real: u64) {
        self.memory_usage = Some(peak);
        self.memory_usage_real = Some(peak_real);
    }

    pub fn stack_trace(&self) -> Option<&StackTrace> {
        self.stack_trace.as_ref()
    }

    pub fn set_stack_trace(&mut self, trace: StackTrace) {
        self.stack_trace = Some(trace);
    }

    // -----------------------------------------------------------------------
    // Output buffers
    // -----------------------------------------------------------------------

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error_output(&self) -> Option<&str> {
        self.error_output.as_deref()
    }

    pub fn add_output(&mut self, chunk: &str) {
        self.output.get_or_insert_with(String::new).push_str(chunk);
    }

    pub fn add_error_output(&mut self, chunk: &str) {
        self.error_output
            .get_or_insert_with(String::new)
            .push_str(chunk);
    }

    pub fn set_output(&mut self, output: impl Into<String>) {
        self.output = Some(output.into());
    }

    pub fn set_error_output(&mut self, output: impl Into<String>) {
        self.error_output = Some(output.into());
    }

    /// Heartbeat: refresh `checked_at` while the job is running.
    pub fn checked(&mut self) {
        self.checked_at = Some(Utc::now());
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Move to `new_state`. Setting the current state again is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition`: the move is not allowed from the current
    ///   state; the job is left untouched.
    pub fn set_state(&mut self, new_state: JobState) -> Result<()> {
        if new_state == self.state {
            return Ok(());
        }

        let allowed = self.state.allowed_transitions();
        if !allowed.contains(&new_state) {
            return Err(QueueError::InvalidStateTransition {
                job: self.to_string(),
                current: self.state,
                target: new_state,
                allowed: allowed.to_vec(),
            });
        }

        let now = Utc::now();
        match (self.state, new_state) {
            (JobState::Pending, JobState::Running) => {
                self.started_at = Some(now);
                self.checked_at = Some(now);
            }
            (JobState::New | JobState::Pending, JobState::Canceled) | (JobState::Running, _) => {
                self.closed_at = Some(now);
            }
            _ => {}
        }

        self.state = new_state;
        Ok(())
    }

    pub fn is_new(&self) -> bool {
        self.state == JobState::New
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_in_final_state(&self) -> bool {
        self.state.is_final()
    }

    pub fn is_closed_non_successful(&self) -> bool {
        self.state.is_non_successful_final()
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    pub fn dependencies(&self) -> &[JobRef] {
        &self.dependencies
    }

    pub fn has_dependency(&self, id: JobId) -> bool {
        self.dependencies.iter().any(|d| d.id == id)
    }

    /// True iff every dependency is `finished`.
    pub fn is_startable(&self) -> bool {
        self.dependencies
            .iter()
            .all(|d| d.state == JobState::Finished)
    }

    /// Make this job wait for `dep`. Adding the same dependency twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation`: `dep` has not been persisted, or this job might
    ///   already have been started.
    pub fn add_dependency(&mut self, dep: &Job) -> Result<()> {
        let dep_id = dep.id.ok_or_else(|| {
            QueueError::InvalidOperation(format!(
                "dependency {dep} must be persisted before it can be added"
            ))
        })?;

        if self.has_dependency(dep_id) {
            return Ok(());
        }

        if self.might_have_started() {
            return Err(QueueError::InvalidOperation(format!(
                "cannot add dependencies to {self}, which might have been started already"
            )));
        }

        self.dependencies.push(JobRef {
            id: dep_id,
            state: dep.state,
        });
        Ok(())
    }

    fn might_have_started(&self) -> bool {
        if self.id.is_none() {
            return false;
        }
        match self.state {
            JobState::New => false,
            JobState::Pending => self.is_startable(),
            _ => true,
        }
    }

    // -----------------------------------------------------------------------
    // Retries
    // -----------------------------------------------------------------------

    pub fn retry_jobs(&self) -> &[JobRef] {
        &self.retry_jobs
    }

    pub fn is_retry_job(&self) -> bool {
        self.original_job.is_some()
    }

    /// Id of the job this one retries, if it is a retry.
    pub fn original_job_id(&self) -> Option<JobId> {
        self.original_job
    }

    /// The original job's id, or this job's own id when it is not a retry.
    pub fn original_or_self_id(&self) -> Option<JobId> {
        self.original_job.or(self.id)
    }

    pub fn is_retry_allowed(&self) -> bool {
        self.max_retries > 0 && (self.retry_jobs.len() as u32) < self.max_retries
    }

    /// True while at least one retry has not reached a final state.
    pub fn is_retried(&self) -> bool {
        self.retry_jobs.iter().any(|r| !r.state.is_final())
    }

    /// # Errors
    ///
    /// - `InvalidOperation`: this job is not pending, or already has an original.
    pub fn set_original_job(&mut self, original: JobId) -> Result<()> {
        if self.state != JobState::Pending {
            return Err(QueueError::InvalidOperation(format!(
                "{self} must be in state \"pending\" to get an original job"
            )));
        }
        if self.original_job.is_some() {
            return Err(QueueError::InvalidOperation(format!(
                "{self} already has an original job set"
            )));
        }
        self.original_job = Some(original);
        Ok(())
    }

    /// Link `retry` as a retry of this job.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation`: this job is not running, either job is not
    ///   persisted, or `retry` cannot take an original.
    pub fn add_retry_job(&mut self, retry: &mut Job) -> Result<()> {
        if self.state != JobState::Running {
            return Err(QueueError::InvalidOperation(
                "retry jobs can only be added to running jobs".to_string(),
            ));
        }
        let (Some(own_id), Some(retry_id)) = (self.id, retry.id) else {
            return Err(QueueError::InvalidOperation(
                "both jobs must be persisted before linking a retry".to_string(),
            ));
        };

        retry.set_original_job(own_id)?;
        self.retry_jobs.push(JobRef {
            id: retry_id,
            state: retry.state,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Related entities
    // -----------------------------------------------------------------------

    pub fn related_entities(&self) -> &[RelatedEntity] {
        &self.related_entities
    }

    /// Attach an external record. Adding the same one twice is a no-op.
    pub fn add_related_entity(&mut self, entity: RelatedEntity) {
        if !self.related_entities.contains(&entity) {
            self.related_entities.push(entity);
        }
    }

    /// First related entity with the given type tag.
    pub fn find_related_entity(&self, kind: &str) -> Option<&RelatedEntity> {
        self.related_entities.iter().find(|e| e.kind == kind)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Job(id = {id}, command = \"{}\")", self.command),
            None => write!(f, "Job(id = -, command = \"{}\")", self.command),
        }
    }
}
