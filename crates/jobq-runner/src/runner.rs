//! The execution loop.
//!
//! One `Runner` per worker name. Each tick it supervises the children it
//! already started, then fills free slots with startable jobs, then sleeps.
//! Several runners may share one database; the store's claim decides who
//! runs what.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use jobq_core::JobqConfig;
use jobq_process::{
    truncate::{strip_ansi, truncate_middle},
    ProcessHandle, SpawnRequest,
};
use jobq_scheduler::{Job, JobFilter, JobManager, JobState, StackTrace};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Environment variable carrying the job id into the child.
pub const JOB_ID_ENV: &str = "JOBQ_JOB_ID";

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub stale_jobs_closed: usize,
    pub jobs_started: usize,
    pub jobs_closed: usize,
}

/// Outcome of one supervision pass over a child.
enum Supervision {
    Running,
    Closed,
    /// The job was closed by someone else; the child was stopped.
    Abandoned,
}

struct RunningJob {
    job: Job,
    process: ProcessHandle,
    last_heartbeat: Instant,
}

pub struct Runner {
    manager: Arc<JobManager>,
    config: JobqConfig,
    worker_name: String,
    running: Vec<RunningJob>,
    stats: RunStats,
}

impl Runner {
    pub fn new(manager: Arc<JobManager>, config: JobqConfig) -> Self {
        let worker_name = config.runner.resolved_worker_name();
        Self {
            manager,
            config,
            worker_name,
            running: Vec::new(),
            stats: RunStats::default(),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Run until `shutdown` flips to `true` or the configured runtime budget
    /// is spent, then wait for in-flight jobs to end.
    ///
    /// A store failure aborts the loop; children still running at that point
    /// are terminated and their jobs closed `incomplete` where possible.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunStats> {
        info!(worker = %self.worker_name, "runner started");
        self.stats.stale_jobs_closed = self.manager.clean_up_stale_jobs(&self.worker_name)?;

        match self.run_loop(&mut shutdown).await {
            Ok(()) => {
                info!(
                    worker = %self.worker_name,
                    started = self.stats.jobs_started,
                    closed = self.stats.jobs_closed,
                    "runner stopped"
                );
                Ok(self.stats)
            }
            Err(e) => {
                error!(worker = %self.worker_name, error = %e, "runner aborted");
                self.abandon_running_jobs().await;
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let started = Instant::now();
        let budget = match self.config.runner.max_runtime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let poll = Duration::from_millis(self.config.runner.poll_interval_ms);
        let idle = Duration::from_secs(self.config.runner.idle_time_secs).max(poll);

        let mut accepting = true;
        let mut signals_open = true;

        loop {
            self.check_running_jobs().await?;

            if accepting && budget.is_some_and(|b| started.elapsed() >= b) {
                info!(running = self.running.len(), "maximum runtime reached; draining");
                accepting = false;
            }
            if accepting && *shutdown.borrow() {
                accepting = false;
            }
            if !accepting && self.running.is_empty() {
                return Ok(());
            }

            let mut pause = poll;
            if accepting {
                let started_any = self.start_jobs()?;
                if !started_any && self.running.is_empty() {
                    pause = idle;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed(), if accepting && signals_open => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            info!(running = self.running.len(), "stop requested; draining");
                            accepting = false;
                        }
                        Ok(()) => {}
                        // Nobody can ask us to stop any more.
                        Err(_) => signals_open = false,
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Start jobs until every slot is taken or nothing is startable.
    /// Returns whether at least one job was started.
    fn start_jobs(&mut self) -> Result<bool> {
        // Fresh each tick: a job blocked now may be unblocked by the next one.
        let mut excluded_ids = Vec::new();
        let mut started_any = false;

        while self.running.len() < self.config.runner.max_concurrent_jobs {
            let filter = JobFilter {
                excluded_commands: Vec::new(),
                excluded_queues: self.saturated_queues(),
                restricted_queues: self.config.runner.queues.clone(),
            };
            let Some(job) =
                self.manager
                    .find_startable_job(&self.worker_name, &mut excluded_ids, &filter)?
            else {
                break;
            };
            if self.start_job(job)? {
                started_any = true;
            }
        }
        Ok(started_any)
    }

    /// Queues whose running count reached their limit.
    fn saturated_queues(&self) -> Vec<String> {
        let mut per_queue: HashMap<&str, usize> = HashMap::new();
        for running in &self.running {
            *per_queue.entry(running.job.queue()).or_default() += 1;
        }
        let mut saturated: Vec<String> = per_queue
            .into_iter()
            .filter(|(queue, count)| *count >= self.config.max_concurrent_jobs_for(queue))
            .map(|(queue, _)| queue.to_string())
            .collect();
        saturated.sort();
        saturated
    }

    fn start_job(&mut self, mut job: Job) -> Result<bool> {
        if !self.manager.start_job(&mut job)? {
            return Ok(false);
        }
        self.stats.jobs_started += 1;
        let job_id = job.id().map(|id| id.to_string()).unwrap_or_default();
        info!(job_id = %job_id, command = %job.command(), queue = %job.queue(), "started job");

        let mut argv = self.config.runner.command_prefix.clone();
        argv.push(job.command().to_string());
        argv.extend(job.args().iter().cloned());

        let spawned = SpawnRequest::from_argv(argv)
            .map(|request| request.env(JOB_ID_ENV, job_id.as_str()))
            .and_then(|request| ProcessHandle::spawn(&request));

        match spawned {
            Ok(process) => {
                debug!(job_id = %job_id, pid = ?process.pid(), "child running");
                self.running.push(RunningJob {
                    job,
                    process,
                    last_heartbeat: Instant::now(),
                });
            }
            Err(e) => {
                self.close_incomplete(&mut job, &e)?;
            }
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Supervision
    // -----------------------------------------------------------------------

    async fn check_running_jobs(&mut self) -> Result<()> {
        let running = std::mem::take(&mut self.running);
        let mut remaining = running.into_iter();

        while let Some(mut entry) = remaining.next() {
            match self.check_job(&mut entry).await {
                Ok(Supervision::Running) => self.running.push(entry),
                Ok(Supervision::Closed) => self.stats.jobs_closed += 1,
                Ok(Supervision::Abandoned) => {}
                Err(e) => {
                    self.running.push(entry);
                    self.running.extend(remaining);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn check_job(&self, entry: &mut RunningJob) -> Result<Supervision> {
        let grace = Duration::from_secs(self.config.runner.terminate_grace_secs);

        let alive = match entry.process.is_alive() {
            Ok(alive) => alive,
            Err(e) => {
                if let Err(kill_err) = entry.process.terminate(grace).await {
                    warn!(job_id = ?entry.job.id(), error = %kill_err, "could not stop child");
                }
                self.close_incomplete(&mut entry.job, &e)?;
                return Ok(Supervision::Closed);
            }
        };

        self.capture_new_output(entry);

        if alive {
            let max_runtime = entry.job.max_runtime();
            if max_runtime > 0 && entry.process.wall_clock() > Duration::from_secs(max_runtime.into())
            {
                info!(job_id = ?entry.job.id(), max_runtime, "job terminated; maximum runtime exceeded");
                if let Err(e) = entry.process.terminate(grace).await {
                    warn!(job_id = ?entry.job.id(), error = %e, "could not stop child");
                }
                self.record_result(entry);
                self.manager.close_job(&mut entry.job, JobState::Terminated)?;
                return Ok(Supervision::Closed);
            }

            let heartbeat = Duration::from_secs(self.config.runner.heartbeat_interval_secs);
            if entry.last_heartbeat.elapsed() >= heartbeat {
                entry.job.checked();
                if !self.manager.heartbeat(&entry.job)? {
                    warn!(job_id = ?entry.job.id(), "job was closed elsewhere; stopping child");
                    if let Err(e) = entry.process.terminate(grace).await {
                        warn!(job_id = ?entry.job.id(), error = %e, "could not stop child");
                    }
                    return Ok(Supervision::Abandoned);
                }
                entry.last_heartbeat = Instant::now();
            }
            return Ok(Supervision::Running);
        }

        if let Err(e) = entry.process.wait().await {
            self.close_incomplete(&mut entry.job, &e)?;
            return Ok(Supervision::Closed);
        }
        self.capture_new_output(entry);
        self.record_result(entry);

        let exit_code = entry.job.exit_code().unwrap_or(-1);
        let state = if exit_code == 0 {
            JobState::Finished
        } else {
            JobState::Failed
        };
        info!(job_id = ?entry.job.id(), exit_code, "job finished with exit code {exit_code}");
        self.manager.close_job(&mut entry.job, state)?;
        Ok(Supervision::Closed)
    }

    /// Append what the child wrote since the last tick, and log it.
    fn capture_new_output(&self, entry: &mut RunningJob) {
        let max_chars = self.config.runner.max_logged_output_chars;
        let out = entry.process.take_new_output();
        if !out.is_empty() {
            debug!(job_id = ?entry.job.id(), output = %truncate_middle(&strip_ansi(&out), max_chars), "job output");
            entry.job.add_output(&out);
        }
        let err = entry.process.take_new_error_output();
        if !err.is_empty() {
            debug!(job_id = ?entry.job.id(), output = %truncate_middle(&strip_ansi(&err), max_chars), "job error output");
            entry.job.add_error_output(&err);
        }
    }

    /// Copy exit code, full output, runtime and memory onto the job.
    fn record_result(&self, entry: &mut RunningJob) {
        let process = &entry.process;
        let job = &mut entry.job;
        if let Some(code) = process.exit_code() {
            job.set_exit_code(code);
        }
        job.set_output(process.output());
        job.set_error_output(process.error_output());
        job.set_runtime(u32::try_from(process.wall_clock().as_secs()).unwrap_or(u32::MAX));
        let memory = process.peak_memory();
        if memory.peak_resident > 0 || memory.peak_virtual > 0 {
            job.set_memory_usage(memory.peak_resident, memory.peak_virtual);
        }
    }

    fn close_incomplete(
        &self,
        job: &mut Job,
        err: &(dyn std::error::Error + 'static),
    ) -> Result<()> {
        error!(job_id = ?job.id(), command = %job.command(), error = %err, "job supervision failed");
        job.set_stack_trace(StackTrace::from_error(err));
        self.manager.close_job(job, JobState::Incomplete)?;
        Ok(())
    }

    /// Best effort after a fatal error: stop every child and close its job.
    async fn abandon_running_jobs(&mut self) {
        let grace = Duration::from_secs(self.config.runner.terminate_grace_secs);
        for mut entry in self.running.drain(..) {
            if let Err(e) = entry.process.terminate(grace).await {
                warn!(job_id = ?entry.job.id(), error = %e, "could not stop child");
            }
            if let Err(e) = self.manager.close_job(&mut entry.job, JobState::Incomplete) {
                warn!(job_id = ?entry.job.id(), error = %e, "could not close job as incomplete");
            }
        }
    }
}
