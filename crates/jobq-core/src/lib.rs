//! `jobq-core`: configuration and shared constants for the jobq workspace.

pub mod config;
pub mod error;

pub use config::JobqConfig;
pub use error::{CoreError, Result};
