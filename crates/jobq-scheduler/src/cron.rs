use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::{
    db::init_db,
    error::{QueueError, Result},
    store::ts,
};

pub const MAX_CRON_COMMAND_LENGTH: usize = 200;

/// Remembers when each periodic command was last enqueued.
///
/// Used by schedulers layered on top of the queue; the runner itself never
/// reads it.
pub struct CronTracker {
    db: Arc<Mutex<Connection>>,
}

impl CronTracker {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self::from_shared(Arc::new(Mutex::new(conn))))
    }

    pub(crate) fn from_shared(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// When `command` last ran, or `None` if it never did.
    pub fn last_run_at(&self, command: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().unwrap();
        let raw: Option<String> = db
            .query_row(
                "SELECT last_run_at FROM cron_jobs WHERE command = ?1",
                [command],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| QueueError::CorruptRecord(format!("bad last_run_at {s:?}: {e}")))
        })
        .transpose()
    }

    /// Stamp `command` as run now, creating its row on first use.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: `command` is empty or longer than
    ///   [`MAX_CRON_COMMAND_LENGTH`].
    pub fn record_run(&self, command: &str) -> Result<DateTime<Utc>> {
        if command.is_empty() || command.len() > MAX_CRON_COMMAND_LENGTH {
            return Err(QueueError::InvalidArgument(format!(
                "cron command must be 1..={MAX_CRON_COMMAND_LENGTH} chars, got {}",
                command.len()
            )));
        }

        let now = Utc::now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO cron_jobs (command, last_run_at) VALUES (?1, ?2)
             ON CONFLICT (command) DO UPDATE SET last_run_at = excluded.last_run_at",
            rusqlite::params![command, ts(&now)],
        )?;
        debug!(%command, "cron run recorded");
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CronTracker {
        CronTracker::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn unknown_command_never_ran() {
        assert!(tracker().last_run_at("report:daily").unwrap().is_none());
    }

    #[test]
    fn record_then_read_back() {
        let t = tracker();
        let first = t.record_run("report:daily").unwrap();
        let stored = t.last_run_at("report:daily").unwrap().unwrap();
        assert!((stored - first).num_microseconds().unwrap().abs() <= 1);

        let second = t.record_run("report:daily").unwrap();
        assert!(second >= first);
        let stored = t.last_run_at("report:daily").unwrap().unwrap();
        assert!(stored >= first);
    }

    #[test]
    fn command_length_is_bounded() {
        let t = tracker();
        assert!(t.record_run(&"c".repeat(MAX_CRON_COMMAND_LENGTH)).is_ok());
        assert!(matches!(
            t.record_run(&"c".repeat(MAX_CRON_COMMAND_LENGTH + 1)),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(t.record_run("").is_err());
    }
}
