use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const DEFAULT_IDLE_TIME_SECS: u64 = 2;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_TERMINATE_GRACE_SECS: u64 = 5;
pub const DEFAULT_MAX_LOGGED_OUTPUT_CHARS: usize = 2_000;
pub const DEFAULT_RETRY_BASE_SECS: u64 = 5;
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 3_600;
/// Worker names share the 50-char column with queue names.
pub const MAX_WORKER_NAME_LENGTH: usize = 50;

/// Top-level config (jobq.toml + JOBQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobqConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Applied to every queue without its own `[queues.<name>]` entry.
    #[serde(default)]
    pub queue_defaults: QueueOptions,
    #[serde(default)]
    pub queues: HashMap<String, QueueOptions>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the SQLite file if it is missing.
    pub fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Knobs for the execution loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Identifies this runner instance in `jobs.worker_name`.
    /// Defaults to `<hostname>-<pid>` when unset.
    pub worker_name: Option<String>,
    /// Loop-wide budget in seconds; 0 means run until a stop signal arrives.
    #[serde(default)]
    pub max_runtime_secs: u64,
    /// Global cap on simultaneously running jobs, and the fallback per-queue limit.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Pause after a poll found nothing startable.
    #[serde(default = "default_idle_time_secs")]
    pub idle_time_secs: u64,
    /// Pause between two loop ticks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Time between SIGTERM and SIGKILL when a job is terminated.
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// Argv prepended to every job command, e.g. `["php", "bin/console"]`.
    #[serde(default)]
    pub command_prefix: Vec<String>,
    #[serde(default = "default_max_logged_output_chars")]
    pub max_logged_output_chars: usize,
    /// Only service these queues. Empty means every queue.
    #[serde(default)]
    pub queues: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_name: None,
            max_runtime_secs: 0,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            idle_time_secs: DEFAULT_IDLE_TIME_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            terminate_grace_secs: DEFAULT_TERMINATE_GRACE_SECS,
            command_prefix: Vec::new(),
            max_logged_output_chars: DEFAULT_MAX_LOGGED_OUTPUT_CHARS,
            queues: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// The configured worker name, or `<hostname>-<pid>` with the hostname
    /// shortened to fit [`MAX_WORKER_NAME_LENGTH`].
    pub fn resolved_worker_name(&self) -> String {
        self.worker_name
            .clone()
            .unwrap_or_else(|| default_worker_name(&hostname(), std::process::id()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub max_concurrent_jobs: Option<usize>,
}

/// Exponential backoff parameters for retry jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_secs")]
    pub base_secs: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: DEFAULT_RETRY_BASE_SECS,
            max_delay_secs: DEFAULT_RETRY_MAX_DELAY_SECS,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobq/jobq.db", home)
}
fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_idle_time_secs() -> u64 {
    DEFAULT_IDLE_TIME_SECS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_terminate_grace_secs() -> u64 {
    DEFAULT_TERMINATE_GRACE_SECS
}
fn default_max_logged_output_chars() -> usize {
    DEFAULT_MAX_LOGGED_OUTPUT_CHARS
}
fn default_retry_base_secs() -> u64 {
    DEFAULT_RETRY_BASE_SECS
}
fn default_retry_max_delay_secs() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_SECS
}

impl JobqConfig {
    /// Load config from a TOML file with JOBQ_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobq/jobq.toml
    ///
    /// A missing file is not an error; defaults apply. Nested keys use a
    /// double underscore: `JOBQ_RUNNER__WORKER_NAME=w1`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::extract(
            Figment::from(Serialized::defaults(JobqConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("JOBQ_").split("__")),
        )
    }

    /// Parse config from an in-memory TOML document, without env overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(
            Figment::from(Serialized::defaults(JobqConfig::default())).merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: JobqConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.runner.max_concurrent_jobs == 0 {
            return Err(CoreError::Config(
                "runner.max_concurrent_jobs must be greater than zero".to_string(),
            ));
        }
        if let Some(name) = &self.runner.worker_name {
            if name.trim().is_empty() || name.len() > MAX_WORKER_NAME_LENGTH {
                return Err(CoreError::Config(format!(
                    "runner.worker_name must be 1..={MAX_WORKER_NAME_LENGTH} chars, got {:?}",
                    name
                )));
            }
        }
        if self.queue_defaults.max_concurrent_jobs == Some(0) {
            return Err(CoreError::Config(
                "queue_defaults.max_concurrent_jobs must be greater than zero".to_string(),
            ));
        }
        for (queue, opts) in &self.queues {
            if opts.max_concurrent_jobs == Some(0) {
                return Err(CoreError::Config(format!(
                    "queues.{queue}.max_concurrent_jobs must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Concurrency limit for `queue`: queue-specific, then queue default,
    /// then the runner-wide cap.
    pub fn max_concurrent_jobs_for(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .and_then(|o| o.max_concurrent_jobs)
            .or(self.queue_defaults.max_concurrent_jobs)
            .unwrap_or(self.runner.max_concurrent_jobs)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobq/jobq.toml", home)
}

fn default_worker_name(host: &str, pid: u32) -> String {
    let suffix = format!("-{pid}");
    let room = MAX_WORKER_NAME_LENGTH.saturating_sub(suffix.len());
    let mut end = room.min(host.len());
    while !host.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{suffix}", &host[..end])
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // Safety: buf is writable for its full length; gethostname NUL-terminates
    // on success when the name fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = JobqConfig::from_toml_str("").unwrap();
        assert_eq!(config.runner.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
        assert_eq!(config.runner.max_runtime_secs, 0);
        assert_eq!(config.retry.base_secs, DEFAULT_RETRY_BASE_SECS);
        assert!(config.queues.is_empty());
    }

    #[test]
    fn queue_limit_resolution_order() {
        let config = JobqConfig::from_toml_str(
            r#"
            [runner]
            max_concurrent_jobs = 8

            [queue_defaults]
            max_concurrent_jobs = 3

            [queues.mail]
            max_concurrent_jobs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_jobs_for("mail"), 1);
        assert_eq!(config.max_concurrent_jobs_for("default"), 3);
    }

    #[test]
    fn runner_cap_is_the_last_fallback() {
        let config = JobqConfig::from_toml_str("[runner]\nmax_concurrent_jobs = 2\n").unwrap();
        assert_eq!(config.max_concurrent_jobs_for("anything"), 2);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = JobqConfig::from_toml_str("[runner]\nmax_concurrent_jobs = 0\n").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn overlong_worker_name_is_rejected() {
        let doc = format!("[runner]\nworker_name = \"{}\"\n", "w".repeat(51));
        assert!(JobqConfig::from_toml_str(&doc).is_err());
    }

    #[test]
    fn default_worker_name_contains_pid() {
        let name = RunnerConfig::default().resolved_worker_name();
        assert!(name.ends_with(&format!("-{}", std::process::id())));
    }

    #[test]
    fn zero_queue_default_limit_is_rejected() {
        let err = JobqConfig::from_toml_str("[queue_defaults]\nmax_concurrent_jobs = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("queue_defaults.max_concurrent_jobs"));
    }

    #[test]
    fn default_worker_name_fits_the_column() {
        assert_eq!(default_worker_name("box", 42), "box-42");

        let long_host = "h".repeat(80);
        let name = default_worker_name(&long_host, 4_194_304);
        assert_eq!(name.len(), MAX_WORKER_NAME_LENGTH);
        assert!(name.ends_with("-4194304"));

        let resolved = RunnerConfig::default().resolved_worker_name();
        assert!(resolved.len() <= MAX_WORKER_NAME_LENGTH);
    }
}
