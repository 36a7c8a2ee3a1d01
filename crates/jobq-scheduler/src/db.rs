use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Safe to call on every startup: it uses `IF NOT EXISTS` throughout.
/// Also registers the `rarray` table function used by job selection.
pub fn init_db(conn: &Connection) -> Result<()> {
    rusqlite::vtab::array::load_module(conn)?;
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS jobs (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            state             TEXT    NOT NULL,
            queue             TEXT    NOT NULL,
            priority          INTEGER NOT NULL DEFAULT 0,  -- negated: ascending = most urgent first
            command           TEXT    NOT NULL,
            args              TEXT    NOT NULL,            -- JSON array of strings
            created_at        TEXT    NOT NULL,
            execute_after     TEXT    NOT NULL,
            started_at        TEXT,
            checked_at        TEXT,
            closed_at         TEXT,
            worker_name       TEXT,
            output            TEXT,
            error_output      TEXT,
            exit_code         INTEGER,
            max_runtime       INTEGER NOT NULL DEFAULT 0,
            max_retries       INTEGER NOT NULL DEFAULT 0,
            original_job_id   INTEGER REFERENCES jobs (id),
            stack_trace       TEXT,                        -- JSON-encoded StackTrace
            runtime           INTEGER,
            memory_usage      INTEGER,
            memory_usage_real INTEGER
        ) STRICT;

        -- Selection: WHERE state = 'pending' ORDER BY priority, id
        CREATE INDEX IF NOT EXISTS idx_jobs_sorting ON jobs (state, priority, id);
        -- Idempotent lookup by command + args
        CREATE INDEX IF NOT EXISTS idx_jobs_command ON jobs (command);
        CREATE INDEX IF NOT EXISTS idx_jobs_original ON jobs (original_job_id);

        -- source_job_id waits for dest_job_id
        CREATE TABLE IF NOT EXISTS job_dependencies (
            source_job_id INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            dest_job_id   INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            PRIMARY KEY (source_job_id, dest_job_id)
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_job_dependencies_dest ON job_dependencies (dest_job_id);

        CREATE TABLE IF NOT EXISTS job_related_entities (
            job_id       INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            related_type TEXT    NOT NULL,
            related_id   TEXT    NOT NULL,
            PRIMARY KEY (job_id, related_type, related_id)
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_job_related_lookup
            ON job_related_entities (related_type, related_id);

        CREATE TABLE IF NOT EXISTS cron_jobs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            command     TEXT    NOT NULL UNIQUE,
            last_run_at TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('jobs', 'job_dependencies', 'job_related_entities', 'cron_jobs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
