use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use jobq_core::JobqConfig;
use jobq_runner::Runner;
use jobq_scheduler::{
    ExponentialRetryScheduler, Job, JobId, JobManager, StateChange, PRIORITY_DEFAULT,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "jobq", about = "Persistent job queue runner")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("JOBQ_GIT_SHA"), ")"))]
struct Cli {
    /// Config file (default: $JOBQ_CONFIG, then ~/.jobq/jobq.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending jobs until stopped or the runtime budget is spent
    Run {
        /// Stop admitting jobs after this many seconds (0 = no limit)
        #[arg(long)]
        max_runtime: Option<u64>,

        /// Name recorded on claimed jobs (default: <hostname>-<pid>)
        #[arg(long)]
        worker_name: Option<String>,

        /// Only run jobs from this queue; repeat for several
        #[arg(long = "queue", short = 'q')]
        queues: Vec<String>,

        /// Maximum number of jobs running at the same time
        #[arg(long, short = 'j')]
        max_concurrent_jobs: Option<usize>,

        /// Seconds to sleep when nothing is startable
        #[arg(long)]
        idle_time: Option<u64>,
    },

    /// Force-close a job as incomplete, e.g. after its worker died
    MarkIncomplete {
        job_id: JobId,
    },

    /// Add a job to the queue
    Enqueue {
        /// Queue name
        #[arg(long, short = 'q', default_value = jobq_scheduler::job::DEFAULT_QUEUE)]
        queue: String,

        /// Higher runs first
        #[arg(long, short = 'p', default_value_t = PRIORITY_DEFAULT, allow_negative_numbers = true)]
        priority: i16,

        /// Seconds before the runner terminates the job (0 = no limit)
        #[arg(long, default_value_t = 0)]
        max_runtime: u32,

        #[arg(long, default_value_t = 0)]
        max_retries: u32,

        /// Id of a job that must finish first; repeat for several
        #[arg(long = "depends-on")]
        depends_on: Vec<JobId>,

        /// Reuse an existing job with the same command and arguments
        #[arg(long, conflicts_with_all = ["depends_on", "queue", "priority", "max_runtime", "max_retries"])]
        unique: bool,

        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show pending jobs per queue and the most recent failures
    Stats {
        /// Number of failed jobs to list
        #[arg(long, default_value_t = 10)]
        errors: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "jobq_runner=debug,jobq_scheduler=debug,jobq_process=debug"
    } else {
        "jobq_runner=info,jobq_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // load config: --config > JOBQ_CONFIG env > ~/.jobq/jobq.toml
    let config_path = cli.config.or_else(|| std::env::var("JOBQ_CONFIG").ok());
    let mut config = JobqConfig::load(config_path.as_deref())
        .map_err(|e| anyhow!("[{}] {e}", e.code()))?;

    match cli.command {
        Commands::Run {
            max_runtime,
            worker_name,
            queues,
            max_concurrent_jobs,
            idle_time,
        } => {
            if let Some(secs) = max_runtime {
                config.runner.max_runtime_secs = secs;
            }
            if worker_name.is_some() {
                config.runner.worker_name = worker_name;
            }
            if !queues.is_empty() {
                config.runner.queues = queues;
            }
            if let Some(n) = max_concurrent_jobs {
                config.runner.max_concurrent_jobs = n;
            }
            if let Some(secs) = idle_time {
                config.runner.idle_time_secs = secs;
            }
            config.validate().map_err(|e| anyhow!("[{}] {e}", e.code()))?;
            run(config).await
        }
        Commands::MarkIncomplete { job_id } => {
            let manager = open_manager(&config, None)?;
            let job = manager
                .mark_job_incomplete(job_id)
                .with_context(|| format!("cannot mark job {job_id} incomplete"))?;
            println!("{job} is now {}", job.state());
            Ok(())
        }
        Commands::Enqueue {
            queue,
            priority,
            max_runtime,
            max_retries,
            depends_on,
            unique,
            command,
            args,
        } => {
            let manager = open_manager(&config, None)?;
            if unique {
                let job = manager.get_or_create_if_not_exists(&command, args)?;
                println!("{job} ({})", job.state());
                return Ok(());
            }

            let mut job = Job::create(command, args, true, queue, priority)?;
            job.set_max_runtime(max_runtime);
            job.set_max_retries(max_retries);
            for dep_id in depends_on {
                let dep = manager.load_job(dep_id)?;
                job.add_dependency(&dep)?;
            }
            manager.add_job(&mut job)?;
            println!("{job} enqueued on \"{}\"", job.queue());
            Ok(())
        }
        Commands::Stats { errors } => {
            let manager = open_manager(&config, None)?;
            for queue in manager.available_queues()? {
                println!("{queue}: {} pending", manager.count_available_jobs(&queue)?);
            }
            for job in manager.find_last_jobs_with_error(errors)? {
                let closed = job
                    .closed_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{job} {} at {closed} (exit code {:?})", job.state(), job.exit_code());
            }
            Ok(())
        }
    }
}

async fn run(config: JobqConfig) -> anyhow::Result<()> {
    // State changes: JobManager → log dispatcher task
    let (state_tx, mut state_rx) = mpsc::channel::<StateChange>(256);
    tokio::spawn(async move {
        while let Some(change) = state_rx.recv().await {
            info!(
                job_id = %change.job_id,
                command = %change.command,
                state = %change.new_state,
                "job state changed"
            );
        }
    });

    let manager = open_manager(&config, Some(state_tx))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let runner = Runner::new(manager, config);
    let stats = runner.run(shutdown_rx).await?;
    info!(
        stale = stats.stale_jobs_closed,
        started = stats.jobs_started,
        closed = stats.jobs_closed,
        "done"
    );
    Ok(())
}

fn open_manager(
    config: &JobqConfig,
    state_tx: Option<mpsc::Sender<StateChange>>,
) -> anyhow::Result<Arc<JobManager>> {
    let db_path = &config.database.path;
    config
        .database
        .ensure_parent_dir()
        .with_context(|| format!("cannot create directory for {db_path}"))?;
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    // Other runners share the file; wait for their write locks.
    db.busy_timeout(Duration::from_secs(5))?;

    let manager = JobManager::new(db, state_tx)?
        .with_retry_scheduler(ExponentialRetryScheduler::from(&config.retry));
    Ok(Arc::new(manager))
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT; shutting down"),
        () = terminate => info!("received SIGTERM; shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn version_carries_source_revision() {
        let version = Cli::command().get_version().unwrap().to_string();
        assert!(version.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(version.ends_with(&format!("({})", env!("JOBQ_GIT_SHA"))));
        assert!(!env!("JOBQ_GIT_SHA").is_empty());
    }

    #[test]
    fn run_flags() {
        let cli = Cli::try_parse_from([
            "jobq", "run", "--max-runtime", "60", "-q", "mail", "-q", "reports", "-j", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                max_runtime,
                queues,
                max_concurrent_jobs,
                worker_name,
                ..
            } => {
                assert_eq!(max_runtime, Some(60));
                assert_eq!(queues, ["mail", "reports"]);
                assert_eq!(max_concurrent_jobs, Some(2));
                assert!(worker_name.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn enqueue_keeps_hyphenated_job_args() {
        let cli = Cli::try_parse_from([
            "jobq", "enqueue", "--priority", "-5", "--depends-on", "3", "report", "--", "--since",
            "-1d",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue {
                priority,
                depends_on,
                command,
                args,
                ..
            } => {
                assert_eq!(priority, -5);
                assert_eq!(depends_on, [JobId(3)]);
                assert_eq!(command, "report");
                assert_eq!(args, ["--since", "-1d"]);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn mark_incomplete_requires_numeric_id() {
        assert!(Cli::try_parse_from(["jobq", "mark-incomplete", "abc"]).is_err());
        let cli = Cli::try_parse_from(["jobq", "mark-incomplete", "42"]).unwrap();
        assert!(matches!(cli.command, Commands::MarkIncomplete { job_id } if job_id == JobId(42)));
    }
}
