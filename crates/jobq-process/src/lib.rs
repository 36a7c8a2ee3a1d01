//! jobq-process: supervision of job child processes.
//!
//! A [`ProcessHandle`] owns one child: it captures stdout and stderr
//! incrementally, tracks wall-clock time and peak memory, and can terminate
//! the child gracefully.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use jobq_process::{ProcessHandle, SpawnRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let request = SpawnRequest::from_argv(vec!["echo".into(), "hello".into()])
//!         .unwrap()
//!         .env("JOBQ_JOB_ID", "1");
//!     let mut child = ProcessHandle::spawn(&request).unwrap();
//!     while child.is_alive().unwrap() {
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!     }
//!     child.wait().await.unwrap();
//!     println!("{} -> {:?}", child.output(), child.exit_code());
//! }
//! ```

pub mod error;
pub mod handle;
pub mod memory;
pub mod truncate;

pub use error::{ProcessError, Result};
pub use handle::{ProcessHandle, SpawnRequest};
pub use memory::MemorySample;
