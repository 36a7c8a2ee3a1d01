//! End-to-end runner scenarios against an in-memory queue and real
//! `/bin/sh` children.
#![cfg(unix)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use jobq_core::{config::QueueOptions, JobqConfig};
use jobq_runner::{RunStats, Runner};
use jobq_scheduler::{Job, JobFilter, JobId, JobManager, JobState, PRIORITY_HIGH, PRIORITY_LOW};
use rusqlite::Connection;
use tokio::sync::watch;

const WORKER: &str = "test-worker";

fn manager() -> Arc<JobManager> {
    let conn = Connection::open_in_memory().unwrap();
    let manager = JobManager::new(conn, None)
        .unwrap()
        .with_retry_scheduler(|_: u32| Duration::ZERO);
    Arc::new(manager)
}

/// Jobs are shell snippets: the command is passed to `sh -c`.
fn config(max_concurrent_jobs: usize) -> JobqConfig {
    let mut config = JobqConfig::default();
    config.runner.worker_name = Some(WORKER.to_string());
    config.runner.max_concurrent_jobs = max_concurrent_jobs;
    config.runner.poll_interval_ms = 20;
    config.runner.idle_time_secs = 0;
    config.runner.heartbeat_interval_secs = 1;
    config.runner.terminate_grace_secs = 1;
    config.runner.command_prefix = vec!["/bin/sh".to_string(), "-c".to_string()];
    config
}

fn enqueue(manager: &JobManager, script: &str) -> JobId {
    enqueue_job(manager, Job::new(script, Vec::new()))
}

fn enqueue_job(manager: &JobManager, mut job: Job) -> JobId {
    manager.add_job(&mut job).unwrap()
}

fn load(manager: &JobManager, id: JobId) -> Job {
    manager.load_job(id).unwrap()
}

/// Run until every job in `ids` is final, then ask the runner to stop.
async fn run_until_closed(manager: &Arc<JobManager>, config: JobqConfig, ids: &[JobId]) -> RunStats {
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = Runner::new(Arc::clone(manager), config);

    let watcher = async {
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            if ids.iter().all(|id| load(manager, *id).is_in_final_state()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = stop_tx.send(true);
    };

    let (stats, ()) = tokio::join!(runner.run(stop_rx), watcher);
    stats.unwrap()
}

#[tokio::test]
async fn single_slot_runs_jobs_in_insertion_order() {
    let m = manager();
    let ids: Vec<JobId> = (0..3).map(|_| enqueue(&m, "true")).collect();

    let stats = run_until_closed(&m, config(1), &ids).await;
    assert_eq!(stats.jobs_started, 3);
    assert_eq!(stats.jobs_closed, 3);

    let jobs: Vec<Job> = ids.iter().map(|id| load(&m, *id)).collect();
    for job in &jobs {
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.exit_code(), Some(0));
        assert_eq!(job.worker_name(), Some(WORKER));
    }
    for pair in jobs.windows(2) {
        assert!(pair[0].closed_at().unwrap() <= pair[1].started_at().unwrap());
    }
}

#[tokio::test]
async fn higher_priority_starts_first() {
    let m = manager();
    let low = enqueue_job(&m, Job::create("true", vec![], true, "default", PRIORITY_LOW).unwrap());
    let high = enqueue_job(&m, Job::create("true", vec![], true, "default", PRIORITY_HIGH).unwrap());

    run_until_closed(&m, config(1), &[low, high]).await;

    let (low, high) = (load(&m, low), load(&m, high));
    assert!(high.closed_at().unwrap() <= low.started_at().unwrap());
}

#[tokio::test]
async fn dependent_waits_for_all_dependencies() {
    let m = manager();
    let a = enqueue(&m, "sleep 0.3");
    let b = enqueue(&m, "sleep 0.1");
    let mut c = Job::new("true", Vec::new());
    c.add_dependency(&load(&m, a)).unwrap();
    c.add_dependency(&load(&m, b)).unwrap();
    let c = enqueue_job(&m, c);

    run_until_closed(&m, config(4), &[a, b, c]).await;

    let (a, b, c) = (load(&m, a), load(&m, b), load(&m, c));
    assert_eq!(c.state(), JobState::Finished);
    assert!(c.started_at().unwrap() >= a.closed_at().unwrap());
    assert!(c.started_at().unwrap() >= b.closed_at().unwrap());
}

#[tokio::test]
async fn failure_cancels_blocked_dependents() {
    let m = manager();
    let a = enqueue(&m, "exit 1");
    let mut b = Job::new("true", Vec::new());
    b.add_dependency(&load(&m, a)).unwrap();
    let b = enqueue_job(&m, b);

    run_until_closed(&m, config(2), &[a, b]).await;

    assert_eq!(load(&m, a).state(), JobState::Failed);
    let b = load(&m, b);
    assert_eq!(b.state(), JobState::Canceled);
    assert!(b.started_at().is_none());
}

#[tokio::test]
async fn overrunning_job_is_terminated() {
    let m = manager();
    let mut job = Job::new("sleep 30", Vec::new());
    job.set_max_runtime(1);
    let id = enqueue_job(&m, job);

    let begun = Instant::now();
    run_until_closed(&m, config(1), &[id]).await;

    assert!(begun.elapsed() < Duration::from_secs(10));
    let job = load(&m, id);
    assert_eq!(job.state(), JobState::Terminated);
    assert!(job.closed_at().is_some());
}

#[tokio::test]
async fn failing_job_is_retried_until_budget_is_spent() {
    let m = manager();
    let mut job = Job::new("exit 3", Vec::new());
    job.set_max_retries(2);
    let id = enqueue_job(&m, job);

    let stats = run_until_closed(&m, config(1), &[id]).await;
    assert_eq!(stats.jobs_started, 3);

    let original = load(&m, id);
    assert_eq!(original.state(), JobState::Failed);
    assert_eq!(original.exit_code(), Some(3));
    assert_eq!(original.retry_jobs().len(), 2);
    for retry in original.retry_jobs() {
        let retry = load(&m, retry.id);
        assert_eq!(retry.state(), JobState::Failed);
        assert_eq!(retry.original_job_id(), Some(id));
        assert_eq!(retry.exit_code(), Some(3));
    }
}

#[tokio::test]
async fn successful_retry_finishes_the_original() {
    let m = manager();
    let marker = std::env::temp_dir().join(format!("jobq-retry-{}", std::process::id()));
    let _ = std::fs::remove_file(&marker);
    // Fails on the first attempt, succeeds once the marker exists.
    let script = format!(
        "if [ -e '{0}' ]; then exit 0; else touch '{0}'; exit 1; fi",
        marker.display()
    );
    let mut job = Job::new(script, Vec::new());
    job.set_max_retries(3);
    let id = enqueue_job(&m, job);

    run_until_closed(&m, config(1), &[id]).await;
    let _ = std::fs::remove_file(&marker);

    let original = load(&m, id);
    assert_eq!(original.state(), JobState::Finished);
    assert_eq!(original.retry_jobs().len(), 1);
    assert_eq!(load(&m, original.retry_jobs()[0].id).state(), JobState::Finished);
}

#[tokio::test]
async fn restricted_runner_ignores_other_queues() {
    let m = manager();
    let mail = enqueue_job(&m, Job::create("true", vec![], true, "mail", 0).unwrap());
    let other = enqueue(&m, "true");

    let mut config = config(2);
    config.runner.queues = vec!["mail".to_string()];
    let stats = run_until_closed(&m, config, &[mail]).await;

    assert_eq!(stats.jobs_started, 1);
    assert_eq!(load(&m, mail).state(), JobState::Finished);
    let other = load(&m, other);
    assert_eq!(other.state(), JobState::Pending);
    assert!(other.worker_name().is_none());
}

#[tokio::test]
async fn queue_limit_caps_parallelism() {
    let m = manager();
    let first = enqueue_job(&m, Job::create("sleep 0.3", vec![], true, "mail", 0).unwrap());
    let second = enqueue_job(&m, Job::create("sleep 0.3", vec![], true, "mail", 0).unwrap());

    let mut config = config(4);
    config.queues.insert(
        "mail".to_string(),
        QueueOptions {
            max_concurrent_jobs: Some(1),
        },
    );
    run_until_closed(&m, config, &[first, second]).await;

    let (first, second) = (load(&m, first), load(&m, second));
    assert_eq!(second.state(), JobState::Finished);
    assert!(second.started_at().unwrap() >= first.closed_at().unwrap());
}

#[tokio::test]
async fn captures_output_exit_code_and_job_id() {
    let m = manager();
    let id = enqueue(&m, "echo \"job $JOBQ_JOB_ID\"; echo oops >&2; exit 7");

    run_until_closed(&m, config(1), &[id]).await;

    let job = load(&m, id);
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.exit_code(), Some(7));
    assert_eq!(job.output().unwrap().trim(), format!("job {id}"));
    assert!(job.error_output().unwrap().contains("oops"));
    assert!(job.runtime().is_some());
}

#[tokio::test]
async fn job_args_follow_the_command() {
    let m = manager();
    // sh -c '<script>' $0 $1
    let id = enqueue_job(
        &m,
        Job::new("echo \"$0-$1\"", vec!["alpha".to_string(), "beta".to_string()]),
    );

    run_until_closed(&m, config(1), &[id]).await;

    assert_eq!(load(&m, id).output().unwrap().trim(), "alpha-beta");
}

#[tokio::test]
async fn long_job_gets_heartbeats() {
    let m = manager();
    let id = enqueue(&m, "sleep 1.5");

    run_until_closed(&m, config(1), &[id]).await;

    let job = load(&m, id);
    assert_eq!(job.state(), JobState::Finished);
    assert!(job.checked_at().unwrap() > job.started_at().unwrap());
}

#[tokio::test]
async fn spawn_failure_closes_job_incomplete() {
    let m = manager();
    let id = enqueue(&m, "/nonexistent/jobq-test-binary");

    let mut config = config(1);
    config.runner.command_prefix.clear();
    run_until_closed(&m, config, &[id]).await;

    let job = load(&m, id);
    assert_eq!(job.state(), JobState::Incomplete);
    let trace = job.stack_trace().unwrap();
    assert!(trace.message.contains("/nonexistent/jobq-test-binary"));
}

#[tokio::test]
async fn stale_jobs_of_this_worker_are_closed_on_start() {
    let m = manager();
    let id = enqueue(&m, "true");
    let mut stale = m
        .find_startable_job(WORKER, &mut Vec::new(), &JobFilter::default())
        .unwrap()
        .unwrap();
    assert!(m.start_job(&mut stale).unwrap());

    let stats = run_until_closed(&m, config(1), &[id]).await;

    assert_eq!(stats.stale_jobs_closed, 1);
    assert_eq!(stats.jobs_started, 0);
    assert_eq!(load(&m, id).state(), JobState::Incomplete);
}

#[tokio::test]
async fn runner_exits_when_runtime_budget_is_spent() {
    let m = manager();
    let mut config = config(1);
    config.runner.max_runtime_secs = 1;

    let (_stop_tx, stop_rx) = watch::channel(false);
    let stats = tokio::time::timeout(
        Duration::from_secs(10),
        Runner::new(m, config).run(stop_rx),
    )
    .await
    .expect("runner did not stop on its own")
    .unwrap();
    assert_eq!(stats, RunStats::default());
}

#[tokio::test]
async fn stop_request_lets_running_jobs_finish() {
    let m = manager();
    let id = enqueue(&m, "sleep 0.5");
    let queued = enqueue(&m, "true");

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = Runner::new(Arc::clone(&m), config(1));
    let stopper = async {
        while !load(&m, id).is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = stop_tx.send(true);
    };
    let (stats, ()) = tokio::join!(runner.run(stop_rx), stopper);

    assert_eq!(stats.unwrap().jobs_started, 1);
    assert_eq!(load(&m, id).state(), JobState::Finished);
    assert_eq!(load(&m, queued).state(), JobState::Pending);
}

#[tokio::test]
async fn job_closed_elsewhere_is_stopped_and_stays_closed() {
    let m = manager();
    let id = enqueue(&m, "sleep 30");

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = Runner::new(Arc::clone(&m), config(1));
    let recovery = async {
        while !load(&m, id).is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        m.mark_job_incomplete(id).unwrap();
        let _ = stop_tx.send(true);
    };

    let begun = Instant::now();
    let (stats, ()) = tokio::join!(runner.run(stop_rx), recovery);
    let stats = stats.unwrap();

    assert!(begun.elapsed() < Duration::from_secs(10));
    assert_eq!(stats.jobs_started, 1);
    assert_eq!(stats.jobs_closed, 0);
    let job = load(&m, id);
    assert_eq!(job.state(), JobState::Incomplete);
    assert!(job.exit_code().is_none());
}
