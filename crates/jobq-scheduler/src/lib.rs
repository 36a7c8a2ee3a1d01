//! `jobq-scheduler`: persistent job queue over SQLite.
//!
//! # Overview
//!
//! Jobs live in a `jobs` table together with their dependency edges and
//! related-entity references. The [`manager::JobManager`] selects and claims
//! startable jobs, and runs the close protocol: retries for failed jobs and
//! cancellation of every dependent a failure blocks.
//!
//! # States
//!
//! | From      | Allowed targets                                   |
//! |-----------|---------------------------------------------------|
//! | `new`     | `pending`, `canceled`                             |
//! | `pending` | `running`, `canceled`                             |
//! | `running` | `finished`, `failed`, `terminated`, `incomplete`  |
//! | any other | none                                              |

pub mod cron;
pub mod db;
pub mod error;
pub mod job;
pub mod manager;
pub mod retry;
mod store;
pub mod types;

pub use cron::CronTracker;
pub use error::{QueueError, Result};
pub use job::{Job, PRIORITY_DEFAULT, PRIORITY_HIGH, PRIORITY_LOW};
pub use manager::JobManager;
pub use retry::{ExponentialRetryScheduler, RetryScheduler};
pub use types::{JobFilter, JobId, JobRef, JobState, RelatedEntity, StackTrace, StateChange};
