use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::{
    cron::CronTracker,
    db::init_db,
    error::{QueueError, Result},
    job::{Job, DEFAULT_QUEUE, PRIORITY_DEFAULT},
    retry::{ExponentialRetryScheduler, RetryScheduler},
    store,
    types::{JobFilter, JobId, JobState, RelatedEntity, StateChange},
};

/// Upper bound for a scheduled retry, used when the policy returns a delay
/// chrono cannot represent.
const MAX_RETRY_HORIZON_DAYS: i64 = 36_500;

/// Bookkeeping for one top-level `close_job` call.
#[derive(Default)]
struct CloseContext {
    visited: HashSet<JobId>,
    /// Jobs whose dependents still have to be canceled, in closing order.
    cascade: VecDeque<JobId>,
    events: Vec<StateChange>,
}

impl CloseContext {
    fn record(&mut self, job: &Job, id: JobId, new_state: JobState) {
        self.events.extend(state_change(job, id, new_state));
    }
}

/// Notification for `job` entering `new_state`. An original with retries
/// reports its outcome through them and gets none.
fn state_change(job: &Job, id: JobId, new_state: JobState) -> Option<StateChange> {
    (job.is_retry_job() || job.retry_jobs().is_empty()).then(|| StateChange {
        job_id: id,
        command: job.command().to_string(),
        new_state,
    })
}

/// Queue operations over a SQLite store: enqueue, selection and claiming,
/// and the close protocol with retries and dependency cascades.
///
/// Every multi-row mutation runs inside one transaction. State-change
/// notifications are buffered until that transaction commits and are then
/// pushed onto the optional channel with `try_send`, so a slow consumer never
/// stalls the queue.
pub struct JobManager {
    db: Arc<Mutex<Connection>>,
    retry_scheduler: Box<dyn RetryScheduler>,
    state_tx: Option<mpsc::Sender<StateChange>>,
}

impl JobManager {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection, state_tx: Option<mpsc::Sender<StateChange>>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            retry_scheduler: Box::new(ExponentialRetryScheduler::default()),
            state_tx,
        })
    }

    /// Replace the retry delay policy.
    pub fn with_retry_scheduler(mut self, scheduler: impl RetryScheduler + 'static) -> Self {
        self.retry_scheduler = Box::new(scheduler);
        self
    }

    /// Last-run tracker sharing this manager's connection.
    pub fn cron_tracker(&self) -> CronTracker {
        CronTracker::from_shared(Arc::clone(&self.db))
    }

    fn notify(&self, events: Vec<StateChange>) {
        let Some(tx) = &self.state_tx else {
            return;
        };
        for event in events {
            if let Err(e) = tx.try_send(event) {
                warn!(error = %e, "state change notification dropped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Persist a new job together with its dependencies and related entities.
    #[instrument(skip_all, fields(command = %job.command(), queue = %job.queue()))]
    pub fn add_job(&self, job: &mut Job) -> Result<JobId> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let id = store::insert_job(&tx, job)?;
        tx.commit()?;
        debug!(job_id = %id, "job added");
        Ok(id)
    }

    /// Persist the heartbeat and the output captured so far for a running job.
    ///
    /// Returns `false`, writing nothing, when the stored job is no longer
    /// running, e.g. after `mark_job_incomplete` from another process.
    pub fn heartbeat(&self, job: &Job) -> Result<bool> {
        let db = self.db.lock().unwrap();
        store::record_progress(&db, job)
    }

    pub fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        store::find_job(&db, id)
    }

    pub fn load_job(&self, id: JobId) -> Result<Job> {
        let db = self.db.lock().unwrap();
        store::load_job(&db, id)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Exact lookup by command, arguments and optionally queue.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no job matches.
    #[instrument(skip_all, fields(command = %command))]
    pub fn get_job(&self, command: &str, args: &[String], queue: Option<&str>) -> Result<Job> {
        let db = self.db.lock().unwrap();
        store::find_by_command_args(&db, command, args, queue)?.ok_or_else(|| {
            QueueError::NotFound(format!("job with command \"{command}\" and args {args:?}"))
        })
    }

    /// Return the job for `command` + `args`, creating it if none exists.
    ///
    /// Concurrent callers converge on the lowest id: each inserts an
    /// unconfirmed row, reads back the first match, and either confirms its
    /// own row or deletes it in favour of the earlier one.
    #[instrument(skip_all, fields(command = %command))]
    pub fn get_or_create_if_not_exists(&self, command: &str, args: Vec<String>) -> Result<Job> {
        {
            let db = self.db.lock().unwrap();
            if let Some(existing) = store::find_by_command_args(&db, command, &args, None)? {
                debug!(job_id = ?existing.id(), "existing job reused");
                return Ok(existing);
            }
        }

        let mut job = Job::create(command, args, false, DEFAULT_QUEUE, PRIORITY_DEFAULT)?;
        let own_id = {
            let db = self.db.lock().unwrap();
            store::insert_job(&db, &mut job)?
        };

        let db = self.db.lock().unwrap();
        let first = store::find_by_command_args(&db, command, job.args(), None)?
            .ok_or_else(|| QueueError::NotFound(format!("job {own_id}")))?;

        if first.id() == Some(own_id) {
            job.set_state(JobState::Pending)?;
            store::update_job(&db, &job)?;
            info!(job_id = %own_id, "job created");
            return Ok(job);
        }

        store::delete_job(&db, own_id)?;
        debug!(job_id = ?first.id(), discarded = %own_id, "lost creation race");
        Ok(first)
    }

    /// First job with `command` that carries `entity`.
    pub fn find_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        store::find_job_for_related_entity(&db, command, entity)
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Highest-priority, lowest-id pending job that is due, unclaimed and
    /// passes `filter`, skipping `excluded_ids`.
    pub fn find_pending_job(&self, excluded_ids: &[JobId], filter: &JobFilter) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        store::select_pending_job(&db, excluded_ids, filter, Utc::now())
    }

    /// Select and claim the next startable job for `worker_name`.
    ///
    /// Candidates that are blocked by dependencies, or that another worker
    /// claimed first, are appended to `excluded_ids`. Callers keep that list
    /// across polls so known-blocked jobs are not fetched again.
    #[instrument(skip_all, fields(worker = %worker_name))]
    pub fn find_startable_job(
        &self,
        worker_name: &str,
        excluded_ids: &mut Vec<JobId>,
        filter: &JobFilter,
    ) -> Result<Option<Job>> {
        loop {
            let Some(mut job) = self.find_pending_job(excluded_ids, filter)? else {
                return Ok(None);
            };
            let id = job
                .id()
                .ok_or_else(|| QueueError::CorruptRecord("selected job without id".to_string()))?;

            if job.is_startable() {
                let claimed = {
                    let db = self.db.lock().unwrap();
                    store::claim_job(&db, id, worker_name)?
                };
                if claimed {
                    job.worker_name = Some(worker_name.to_string());
                    debug!(job_id = %id, "job claimed");
                    return Ok(Some(job));
                }
                debug!(job_id = %id, "job claimed by another worker");
            }

            excluded_ids.push(id);
        }
    }

    /// Move a claimed job from `pending` to `running`.
    ///
    /// Returns `false`, leaving `job` untouched, when the stored row is no
    /// longer pending.
    #[instrument(skip_all, fields(job_id = ?job.id()))]
    pub fn start_job(&self, job: &mut Job) -> Result<bool> {
        let mut running = job.clone();
        running.set_state(JobState::Running)?;

        let started = {
            let db = self.db.lock().unwrap();
            store::update_job_if_state(&db, &running, JobState::Pending)?
        };
        if !started {
            warn!("job left pending state before it could be started");
            return Ok(false);
        }

        if let Some(change) = running
            .id()
            .and_then(|id| state_change(&running, id, JobState::Running))
        {
            self.notify(vec![change]);
        }
        *job = running;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Close `job` in `final_state`, applying retries and cancelling blocked
    /// dependents, all in one transaction.
    ///
    /// Closing a job that is already final is a no-op. On success `job` is
    /// reloaded from the store; on error nothing is persisted and `job` is
    /// left as it was.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation`: `final_state` is not final, or `job` is not persisted.
    /// - `InvalidStateTransition`: the job cannot reach `final_state` from its
    ///   current state.
    #[instrument(skip_all, fields(job_id = ?job.id(), state = %final_state))]
    pub fn close_job(&self, job: &mut Job, final_state: JobState) -> Result<()> {
        if !final_state.is_final() {
            return Err(QueueError::InvalidOperation(format!(
                "\"{final_state}\" is not a final state"
            )));
        }
        let id = persisted_id(job)?;

        let mut ctx = CloseContext::default();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        // The caller's copy may be stale: another process can have closed the
        // job or linked retries since it was loaded.
        let stored = store::load_job(&tx, id)?;
        if stored.is_in_final_state() {
            debug!(state = %stored.state(), "job already closed");
            drop(tx);
            drop(db);
            *job = stored;
            return Ok(());
        }
        let mut working = job.clone();
        working.state = stored.state;
        working.dependencies = stored.dependencies;
        working.retry_jobs = stored.retry_jobs;

        self.close_internal(&tx, &mut working, final_state, &mut ctx)?;

        while let Some(blocker) = ctx.cascade.pop_front() {
            for mut dependent in store::find_incoming_dependencies(&tx, blocker)? {
                if !dependent.is_new() && !dependent.is_pending() {
                    continue;
                }
                debug!(job_id = ?dependent.id(), %blocker, "cancelling blocked dependent");
                self.close_internal(&tx, &mut dependent, JobState::Canceled, &mut ctx)?;
            }
        }

        let refreshed = store::load_job(&tx, id)?;
        tx.commit()?;
        drop(db);

        *job = refreshed;
        self.notify(ctx.events);
        Ok(())
    }

    fn close_internal(
        &self,
        conn: &Connection,
        job: &mut Job,
        final_state: JobState,
        ctx: &mut CloseContext,
    ) -> Result<()> {
        let id = persisted_id(job)?;
        if !ctx.visited.insert(id) {
            return Ok(());
        }
        if job.is_in_final_state() {
            debug!(job_id = %id, state = %job.state(), "job already closed");
            return Ok(());
        }

        ctx.record(job, id, final_state);

        match final_state {
            JobState::Canceled => {
                job.set_state(JobState::Canceled)?;
                store::update_job(conn, job)?;
                match job.original_job_id() {
                    Some(original_id) => self.abandon_original(conn, original_id, ctx),
                    None => {
                        ctx.cascade.push_back(id);
                        Ok(())
                    }
                }
            }
            JobState::Failed | JobState::Terminated | JobState::Incomplete => {
                if let Some(original_id) = job.original_job_id() {
                    job.set_state(final_state)?;
                    store::update_job(conn, job)?;
                    let mut original = store::load_job(conn, original_id)?;
                    return self.close_internal(conn, &mut original, final_state, ctx);
                }

                if job.is_retry_allowed() {
                    return self.schedule_retry(conn, job);
                }

                job.set_state(final_state)?;
                store::update_job(conn, job)?;
                info!(job_id = %id, state = %final_state, "job closed");
                ctx.cascade.push_back(id);
                Ok(())
            }
            JobState::Finished => {
                job.set_state(JobState::Finished)?;
                store::update_job(conn, job)?;
                if let Some(original_id) = job.original_job_id() {
                    let mut original = store::load_job(conn, original_id)?;
                    if !original.is_in_final_state() {
                        original.set_state(JobState::Finished)?;
                        store::update_job(conn, &original)?;
                    }
                    ctx.visited.insert(original_id);
                }
                Ok(())
            }
            JobState::New | JobState::Pending | JobState::Running => Err(
                QueueError::InvalidOperation(format!("\"{final_state}\" is not a final state")),
            ),
        }
    }

    /// A retry was canceled: close its original for good.
    fn abandon_original(
        &self,
        conn: &Connection,
        original_id: JobId,
        ctx: &mut CloseContext,
    ) -> Result<()> {
        if !ctx.visited.insert(original_id) {
            return Ok(());
        }
        let mut original = store::load_job(conn, original_id)?;
        if original.is_in_final_state() {
            return Ok(());
        }

        // Running cannot enter canceled; the original did run at least once.
        let state = if original.is_running() {
            JobState::Incomplete
        } else {
            JobState::Canceled
        };
        original.set_state(state)?;
        store::update_job(conn, &original)?;
        info!(job_id = %original_id, %state, "original job closed after retry was canceled");
        ctx.cascade.push_back(original_id);
        Ok(())
    }

    fn schedule_retry(&self, conn: &Connection, job: &mut Job) -> Result<()> {
        let attempt = u32::try_from(job.retry_jobs().len()).unwrap_or(u32::MAX);
        let delay = self.retry_scheduler.delay_for(attempt);
        let now = Utc::now();
        let execute_after: DateTime<Utc> = Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or_else(|| now + Duration::days(MAX_RETRY_HORIZON_DAYS));

        let mut retry = job.clone_for_retry();
        retry.set_execute_after(execute_after);
        store::insert_job(conn, &mut retry)?;
        job.add_retry_job(&mut retry)?;
        store::update_job(conn, &retry)?;
        store::update_job(conn, job)?;

        info!(
            job_id = ?job.id(),
            retry_id = ?retry.id(),
            attempt = attempt + 1,
            delay_secs = delay.as_secs(),
            "retry scheduled"
        );
        Ok(())
    }

    /// Force-close a job as `incomplete`, e.g. after its worker vanished.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no job has this id.
    #[instrument(skip(self))]
    pub fn mark_job_incomplete(&self, id: JobId) -> Result<Job> {
        let mut job = self.load_job(id)?;
        self.close_job(&mut job, JobState::Incomplete)?;
        Ok(job)
    }

    /// Close jobs a previous run of `worker_name` left `running` as
    /// `incomplete`. Originals that still have retries are skipped; they
    /// close once their retry does. Returns the number of jobs closed.
    #[instrument(skip(self))]
    pub fn clean_up_stale_jobs(&self, worker_name: &str) -> Result<usize> {
        let stale = {
            let db = self.db.lock().unwrap();
            store::find_running_jobs_for_worker(&db, worker_name)?
        };

        let mut closed = 0;
        for mut job in stale {
            if !job.is_retry_job() && !job.retry_jobs().is_empty() {
                continue;
            }
            warn!(job_id = ?job.id(), command = %job.command(), "closing stale job as incomplete");
            self.close_job(&mut job, JobState::Incomplete)?;
            closed += 1;
        }
        Ok(closed)
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    /// Distinct queues that currently hold pending jobs.
    pub fn available_queues(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        store::available_queues(&db)
    }

    /// Unclaimed pending jobs in `queue`, due or not.
    pub fn count_available_jobs(&self, queue: &str) -> Result<u64> {
        let db = self.db.lock().unwrap();
        store::count_available_jobs(&db, queue)
    }

    pub fn find_last_jobs_with_error(&self, limit: usize) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        store::find_last_jobs_with_error(&db, limit)
    }
}

fn persisted_id(job: &Job) -> Result<JobId> {
    job.id()
        .ok_or_else(|| QueueError::InvalidOperation(format!("{job} has not been persisted")))
}
