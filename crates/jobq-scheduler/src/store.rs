//! Row mapping and queries for the `jobs` tables.
//!
//! Every function takes a plain `&Connection` so callers can pass either a
//! connection or an open `Transaction` (which derefs to one).

use chrono::{DateTime, SecondsFormat, Utc};
use std::rc::Rc;

use rusqlite::{
    types::{ToSql, Value},
    Connection, Row,
};

use crate::{
    error::{QueueError, Result},
    job::Job,
    types::{JobFilter, JobId, JobRef, JobState, RelatedEntity, StackTrace},
};

const JOB_COLUMNS: &str = "id, state, queue, priority, command, args, created_at, execute_after,
     started_at, checked_at, closed_at, worker_name, output, error_output, exit_code,
     max_runtime, max_retries, original_job_id, stack_trace, runtime, memory_usage,
     memory_usage_real";

/// Columns written on insert and update, in `job_values` order.
const WRITE_COLUMNS: [&str; 21] = [
    "state",
    "queue",
    "priority",
    "command",
    "args",
    "created_at",
    "execute_after",
    "started_at",
    "checked_at",
    "closed_at",
    "worker_name",
    "output",
    "error_output",
    "exit_code",
    "max_runtime",
    "max_retries",
    "original_job_id",
    "stack_trace",
    "runtime",
    "memory_usage",
    "memory_usage_real",
];

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::CorruptRecord(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_state(s: &str) -> Result<JobState> {
    s.parse::<JobState>().map_err(QueueError::CorruptRecord)
}

fn narrow<T: TryFrom<i64>>(column: &str, v: i64) -> Result<T> {
    T::try_from(v).map_err(|_| QueueError::CorruptRecord(format!("{column} out of range: {v}")))
}

fn opt_text(v: Option<&str>) -> Value {
    v.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn opt_int(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::Integer)
}

fn opt_ts(v: Option<DateTime<Utc>>) -> Value {
    v.map_or(Value::Null, |dt| Value::Text(ts(&dt)))
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Raw `jobs` row before the links are loaded.
struct JobRow {
    id: i64,
    state: String,
    queue: String,
    priority: i64,
    command: String,
    args: String,
    created_at: String,
    execute_after: String,
    started_at: Option<String>,
    checked_at: Option<String>,
    closed_at: Option<String>,
    worker_name: Option<String>,
    output: Option<String>,
    error_output: Option<String>,
    exit_code: Option<i64>,
    max_runtime: i64,
    max_retries: i64,
    original_job_id: Option<i64>,
    stack_trace: Option<String>,
    runtime: Option<i64>,
    memory_usage: Option<i64>,
    memory_usage_real: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            state: row.get(1)?,
            queue: row.get(2)?,
            priority: row.get(3)?,
            command: row.get(4)?,
            args: row.get(5)?,
            created_at: row.get(6)?,
            execute_after: row.get(7)?,
            started_at: row.get(8)?,
            checked_at: row.get(9)?,
            closed_at: row.get(10)?,
            worker_name: row.get(11)?,
            output: row.get(12)?,
            error_output: row.get(13)?,
            exit_code: row.get(14)?,
            max_runtime: row.get(15)?,
            max_retries: row.get(16)?,
            original_job_id: row.get(17)?,
            stack_trace: row.get(18)?,
            runtime: row.get(19)?,
            memory_usage: row.get(20)?,
            memory_usage_real: row.get(21)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let stack_trace: Option<StackTrace> = match self.stack_trace {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        Ok(Job {
            id: Some(JobId(self.id)),
            state: parse_state(&self.state)?,
            queue: self.queue,
            priority: narrow("priority", -self.priority)?,
            command: self.command,
            args: serde_json::from_str(&self.args)?,
            created_at: parse_ts(&self.created_at)?,
            execute_after: parse_ts(&self.execute_after)?,
            started_at: parse_opt_ts(self.started_at)?,
            checked_at: parse_opt_ts(self.checked_at)?,
            closed_at: parse_opt_ts(self.closed_at)?,
            worker_name: self.worker_name,
            dependencies: Vec::new(),
            output: self.output,
            error_output: self.error_output,
            exit_code: self.exit_code.map(|c| narrow("exit_code", c)).transpose()?,
            max_runtime: narrow("max_runtime", self.max_runtime)?,
            max_retries: narrow("max_retries", self.max_retries)?,
            original_job: self.original_job_id.map(JobId),
            retry_jobs: Vec::new(),
            stack_trace,
            runtime: self.runtime.map(|r| narrow("runtime", r)).transpose()?,
            memory_usage: self
                .memory_usage
                .map(|m| narrow("memory_usage", m))
                .transpose()?,
            memory_usage_real: self
                .memory_usage_real
                .map(|m| narrow("memory_usage_real", m))
                .transpose()?,
            related_entities: Vec::new(),
        })
    }
}

fn job_values(job: &Job) -> Result<Vec<Value>> {
    let stack_trace = match &job.stack_trace {
        Some(trace) => Value::Text(serde_json::to_string(trace)?),
        None => Value::Null,
    };
    Ok(vec![
        Value::Text(job.state.as_str().to_string()),
        Value::Text(job.queue.clone()),
        Value::Integer(-i64::from(job.priority)),
        Value::Text(job.command.clone()),
        Value::Text(serde_json::to_string(&job.args)?),
        Value::Text(ts(&job.created_at)),
        Value::Text(ts(&job.execute_after)),
        opt_ts(job.started_at),
        opt_ts(job.checked_at),
        opt_ts(job.closed_at),
        opt_text(job.worker_name.as_deref()),
        opt_text(job.output.as_deref()),
        opt_text(job.error_output.as_deref()),
        opt_int(job.exit_code.map(i64::from)),
        Value::Integer(i64::from(job.max_runtime)),
        Value::Integer(i64::from(job.max_retries)),
        opt_int(job.original_job.map(|id| id.0)),
        stack_trace,
        opt_int(job.runtime.map(i64::from)),
        opt_int(job.memory_usage.map(saturating_i64)),
        opt_int(job.memory_usage_real.map(saturating_i64)),
    ])
}

fn persisted_id(job: &Job) -> Result<JobId> {
    job.id.ok_or_else(|| QueueError::InvalidOperation(format!("{job} has not been persisted")))
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert `job` with its dependency and related-entity links, and assign its id.
pub(crate) fn insert_job(conn: &Connection, job: &mut Job) -> Result<JobId> {
    if job.id.is_some() {
        return Err(QueueError::InvalidOperation(format!(
            "{job} has already been persisted"
        )));
    }

    let placeholders: Vec<String> = (1..=WRITE_COLUMNS.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO jobs ({}) VALUES ({})",
        WRITE_COLUMNS.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, rusqlite::params_from_iter(job_values(job)?))?;

    let id = JobId(conn.last_insert_rowid());
    job.id = Some(id);
    sync_links(conn, job)?;
    Ok(id)
}

fn write_job(conn: &Connection, job: &Job, guard: Option<JobState>) -> Result<usize> {
    let id = persisted_id(job)?;
    let assignments: Vec<String> = WRITE_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ?{}", i + 1))
        .collect();

    let mut values = job_values(job)?;
    let mut sql = format!(
        "UPDATE jobs SET {} WHERE id = ?{}",
        assignments.join(", "),
        values.len() + 1
    );
    values.push(Value::Integer(id.0));
    if let Some(expected) = guard {
        sql.push_str(&format!(" AND state = ?{}", values.len() + 1));
        values.push(Value::Text(expected.as_str().to_string()));
    }

    let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
    if changed > 0 {
        sync_links(conn, job)?;
    }
    Ok(changed)
}

/// Persist every column of an already-inserted job.
pub(crate) fn update_job(conn: &Connection, job: &Job) -> Result<()> {
    if write_job(conn, job, None)? == 0 {
        return Err(QueueError::NotFound(format!("job {}", persisted_id(job)?)));
    }
    Ok(())
}

/// Optimistic write: succeeds only while the stored row is still in `expected`.
pub(crate) fn update_job_if_state(conn: &Connection, job: &Job, expected: JobState) -> Result<bool> {
    Ok(write_job(conn, job, Some(expected))? > 0)
}

/// Heartbeat write: `checked_at` and the output captured so far, and only
/// while the row is still running. Returns `false` once the job was closed
/// by someone else.
pub(crate) fn record_progress(conn: &Connection, job: &Job) -> Result<bool> {
    let id = persisted_id(job)?;
    let changed = conn.execute(
        "UPDATE jobs SET checked_at = ?1, output = ?2, error_output = ?3
         WHERE id = ?4 AND state = 'running'",
        rusqlite::params![
            job.checked_at.map(|dt| ts(&dt)),
            job.output,
            job.error_output,
            id.0
        ],
    )?;
    Ok(changed > 0)
}

fn sync_links(conn: &Connection, job: &Job) -> Result<()> {
    let id = persisted_id(job)?;
    for dep in &job.dependencies {
        conn.prepare_cached(
            "INSERT OR IGNORE INTO job_dependencies (source_job_id, dest_job_id) VALUES (?1, ?2)",
        )?
        .execute(rusqlite::params![id.0, dep.id.0])?;
    }
    for entity in &job.related_entities {
        conn.prepare_cached(
            "INSERT OR IGNORE INTO job_related_entities (job_id, related_type, related_id)
             VALUES (?1, ?2, ?3)",
        )?
        .execute(rusqlite::params![id.0, entity.kind, entity.id])?;
    }
    Ok(())
}

/// Set `worker_name` if nobody claimed the job yet. Returns whether we won.
pub(crate) fn claim_job(conn: &Connection, id: JobId, worker_name: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET worker_name = ?1
         WHERE id = ?2 AND worker_name IS NULL AND state = 'pending'",
        rusqlite::params![worker_name, id.0],
    )?;
    Ok(changed > 0)
}

pub(crate) fn delete_job(conn: &Connection, id: JobId) -> Result<()> {
    conn.execute("DELETE FROM job_dependencies WHERE source_job_id = ?1", [id.0])?;
    conn.execute("DELETE FROM job_related_entities WHERE job_id = ?1", [id.0])?;
    conn.execute("DELETE FROM jobs WHERE id = ?1", [id.0])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn query_jobs<I>(conn: &Connection, tail: &str, params: I) -> Result<Vec<Job>>
where
    I: IntoIterator,
    I::Item: ToSql,
{
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs {tail}");
    // Collect eagerly so `stmt` is dropped before the link queries run.
    let rows: Vec<JobRow> = {
        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map(rusqlite::params_from_iter(params), JobRow::from_row)?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };
    rows.into_iter().map(|row| hydrate(conn, row)).collect()
}

fn query_one<I>(conn: &Connection, tail: &str, params: I) -> Result<Option<Job>>
where
    I: IntoIterator,
    I::Item: ToSql,
{
    Ok(query_jobs(conn, tail, params)?.into_iter().next())
}

fn hydrate(conn: &Connection, row: JobRow) -> Result<Job> {
    let id = row.id;
    let mut job = row.into_job()?;
    job.dependencies = load_refs(
        conn,
        "SELECT d.dest_job_id, j.state FROM job_dependencies d
         JOIN jobs j ON j.id = d.dest_job_id
         WHERE d.source_job_id = ?1 ORDER BY d.dest_job_id",
        id,
    )?;
    job.retry_jobs = load_refs(
        conn,
        "SELECT id, state FROM jobs WHERE original_job_id = ?1 ORDER BY id",
        id,
    )?;

    let mut stmt = conn.prepare_cached(
        "SELECT related_type, related_id FROM job_related_entities
         WHERE job_id = ?1 ORDER BY related_type, related_id",
    )?;
    job.related_entities = stmt
        .query_map([id], |row| Ok(RelatedEntity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(job)
}

fn load_refs(conn: &Connection, sql: &str, id: i64) -> Result<Vec<JobRef>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map([id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut refs = Vec::new();
    for row in rows {
        let (ref_id, state) = row?;
        refs.push(JobRef {
            id: JobId(ref_id),
            state: parse_state(&state)?,
        });
    }
    Ok(refs)
}

pub(crate) fn find_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    query_one(conn, "WHERE id = ?1", vec![Value::Integer(id.0)])
}

pub(crate) fn load_job(conn: &Connection, id: JobId) -> Result<Job> {
    find_job(conn, id)?.ok_or_else(|| QueueError::NotFound(format!("job {id}")))
}

/// Jobs that list `id` among their dependencies.
pub(crate) fn find_incoming_dependencies(conn: &Connection, id: JobId) -> Result<Vec<Job>> {
    query_jobs(
        conn,
        "WHERE id IN (SELECT source_job_id FROM job_dependencies WHERE dest_job_id = ?1)
         ORDER BY id",
        vec![Value::Integer(id.0)],
    )
}

/// Append `AND <column> <op> rarray(?n)`. The whole list binds as a single
/// parameter, so its length is not limited by SQLite's variable count.
fn push_list_condition(
    sql: &mut String,
    params: &mut Vec<Box<dyn ToSql>>,
    column: &str,
    op: &str,
    values: Vec<Value>,
) {
    if values.is_empty() {
        return;
    }
    params.push(Box::new(Rc::new(values)));
    sql.push_str(&format!(" AND {column} {op} rarray(?{})", params.len()));
}

fn text_values(items: &[String]) -> Vec<Value> {
    items.iter().map(|s| Value::Text(s.clone())).collect()
}

/// Most urgent unclaimed pending job that is due at `now`.
///
/// A job becomes due once `execute_after` is at or before `now`.
pub(crate) fn select_pending_job(
    conn: &Connection,
    excluded_ids: &[JobId],
    filter: &JobFilter,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let mut sql = String::from(
        "WHERE state = 'pending' AND worker_name IS NULL AND execute_after <= ?1",
    );
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(ts(&now))];

    push_list_condition(
        &mut sql,
        &mut params,
        "id",
        "NOT IN",
        excluded_ids.iter().map(|id| Value::Integer(id.0)).collect(),
    );
    push_list_condition(
        &mut sql,
        &mut params,
        "command",
        "NOT IN",
        text_values(&filter.excluded_commands),
    );
    push_list_condition(
        &mut sql,
        &mut params,
        "queue",
        "NOT IN",
        text_values(&filter.excluded_queues),
    );
    push_list_condition(
        &mut sql,
        &mut params,
        "queue",
        "IN",
        text_values(&filter.restricted_queues),
    );
    sql.push_str(" ORDER BY priority ASC, id ASC LIMIT 1");

    query_one(conn, &sql, params)
}

/// Lowest-id job with exactly this command and argument list.
pub(crate) fn find_by_command_args(
    conn: &Connection,
    command: &str,
    args: &[String],
    queue: Option<&str>,
) -> Result<Option<Job>> {
    let mut sql = String::from("WHERE command = ?1 AND args = ?2");
    let mut params = vec![
        Value::Text(command.to_string()),
        Value::Text(serde_json::to_string(args)?),
    ];
    if let Some(queue) = queue {
        sql.push_str(" AND queue = ?3");
        params.push(Value::Text(queue.to_string()));
    }
    sql.push_str(" ORDER BY id ASC LIMIT 1");
    query_one(conn, &sql, params)
}

pub(crate) fn find_job_for_related_entity(
    conn: &Connection,
    command: &str,
    entity: &RelatedEntity,
) -> Result<Option<Job>> {
    query_one(
        conn,
        "WHERE command = ?1 AND id IN (
             SELECT job_id FROM job_related_entities
             WHERE related_type = ?2 AND related_id = ?3)
         ORDER BY id ASC LIMIT 1",
        vec![
            Value::Text(command.to_string()),
            Value::Text(entity.kind.clone()),
            Value::Text(entity.id.clone()),
        ],
    )
}

/// Jobs still marked running under `worker_name`.
pub(crate) fn find_running_jobs_for_worker(conn: &Connection, worker_name: &str) -> Result<Vec<Job>> {
    query_jobs(
        conn,
        "WHERE state = 'running' AND worker_name = ?1 ORDER BY id",
        vec![Value::Text(worker_name.to_string())],
    )
}

pub(crate) fn available_queues(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT queue FROM jobs WHERE state = 'pending' ORDER BY queue")?;
    let queues = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(queues)
}

pub(crate) fn count_available_jobs(conn: &Connection, queue: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs
         WHERE state = 'pending' AND worker_name IS NULL AND queue = ?1",
        [queue],
        |row| row.get(0),
    )?;
    narrow("count", count)
}

/// Most recently closed originals that ended in an error state.
pub(crate) fn find_last_jobs_with_error(conn: &Connection, limit: usize) -> Result<Vec<Job>> {
    query_jobs(
        conn,
        "WHERE state IN ('failed', 'terminated', 'incomplete') AND original_job_id IS NULL
         ORDER BY closed_at DESC, id DESC LIMIT ?1",
        vec![Value::Integer(saturating_i64(limit as u64))],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::init_db, job::PRIORITY_HIGH};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn
    }

    #[test]
    fn insert_and_load_preserves_fields() {
        let conn = conn();
        let mut dep = Job::new("dep", vec![]);
        insert_job(&conn, &mut dep).unwrap();

        let mut job = Job::create("send", vec!["a b".into(), "c".into()], true, "mail", PRIORITY_HIGH)
            .unwrap();
        job.set_max_runtime(60);
        job.set_max_retries(2);
        job.add_dependency(&dep).unwrap();
        job.add_related_entity(RelatedEntity::new("invoice", "42"));
        let id = insert_job(&conn, &mut job).unwrap();

        let loaded = load_job(&conn, id).unwrap();
        assert_eq!(loaded.id(), Some(id));
        assert_eq!(loaded.command(), "send");
        assert_eq!(loaded.args(), ["a b", "c"]);
        assert_eq!(loaded.queue(), "mail");
        assert_eq!(loaded.priority(), PRIORITY_HIGH);
        assert_eq!(loaded.max_runtime(), 60);
        assert_eq!(loaded.max_retries(), 2);
        assert_eq!(loaded.dependencies().len(), 1);
        assert_eq!(loaded.dependencies()[0].id, dep.id().unwrap());
        assert_eq!(loaded.related_entities(), [RelatedEntity::new("invoice", "42")]);
        // Stored with microsecond precision.
        let drift = (loaded.created_at() - job.created_at()).num_microseconds().unwrap();
        assert!(drift.abs() <= 1);
    }

    #[test]
    fn priority_is_stored_negated() {
        let conn = conn();
        let mut job = Job::create("a", vec![], true, "default", PRIORITY_HIGH).unwrap();
        let id = insert_job(&conn, &mut job).unwrap();
        let stored: i64 = conn
            .query_row("SELECT priority FROM jobs WHERE id = ?1", [id.0], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, -i64::from(PRIORITY_HIGH));
    }

    #[test]
    fn guarded_update_only_applies_in_expected_state() {
        let conn = conn();
        let mut job = Job::new("a", vec![]);
        insert_job(&conn, &mut job).unwrap();

        job.set_state(JobState::Running).unwrap();
        assert!(!update_job_if_state(&conn, &job, JobState::New).unwrap());
        assert!(update_job_if_state(&conn, &job, JobState::Pending).unwrap());
        assert!(!update_job_if_state(&conn, &job, JobState::Pending).unwrap());
        assert_eq!(load_job(&conn, job.id().unwrap()).unwrap().state(), JobState::Running);
    }

    #[test]
    fn claim_is_exclusive() {
        let conn = conn();
        let mut job = Job::new("a", vec![]);
        let id = insert_job(&conn, &mut job).unwrap();
        assert!(claim_job(&conn, id, "w1").unwrap());
        assert!(!claim_job(&conn, id, "w2").unwrap());
        assert_eq!(load_job(&conn, id).unwrap().worker_name(), Some("w1"));
    }

    #[test]
    fn unknown_state_is_a_corrupt_record() {
        let conn = conn();
        let mut job = Job::new("a", vec![]);
        let id = insert_job(&conn, &mut job).unwrap();
        conn.execute("UPDATE jobs SET state = 'exploded' WHERE id = ?1", [id.0])
            .unwrap();
        assert!(matches!(load_job(&conn, id), Err(QueueError::CorruptRecord(_))));
    }

    #[test]
    fn missing_job_is_not_found() {
        let conn = conn();
        assert!(matches!(load_job(&conn, JobId(404)), Err(QueueError::NotFound(_))));
    }
}
