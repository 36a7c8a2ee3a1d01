//! jobq-runner: the execution loop that drains the queue into child
//! processes, plus the `jobq` command-line front end.

pub mod error;
pub mod runner;

pub use error::{Result, RunnerError};
pub use runner::{RunStats, Runner};
