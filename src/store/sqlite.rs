//! SQLite job store.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::JobRepository;
use crate::jobs::{JobRecord, JobStatus};

const COLUMNS: &str = "id, owner_id, kind, status, attempts, max_attempts, queue_job_id, \
    error_code, error_message, last_error, cancel_requested, payload, result, \
    created_at, updated_at, started_at, completed_at";

/// `JobRepository` on a single SQLite connection.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Opens (or creates) the database and ensures the jobs table exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open job store at {}", path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                id               TEXT PRIMARY KEY,
                owner_id         TEXT NOT NULL,
                kind             TEXT NOT NULL,
                status           TEXT NOT NULL,
                attempts         INTEGER NOT NULL,
                max_attempts     INTEGER NOT NULL,
                queue_job_id     TEXT,
                error_code       TEXT,
                error_message    TEXT,
                last_error       TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                payload          TEXT NOT NULL,
                result           TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                started_at       TEXT,
                completed_at     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at);",
        )
        .context("Failed to create jobs table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests and single-process embedding
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job store connection mutex poisoned"))
    }
}

/// JSON and timestamp columns, serialized
struct Encoded {
    payload: String,
    result: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn encode(record: &JobRecord) -> Result<Encoded> {
    Ok(Encoded {
        payload: serde_json::to_string(&record.payload).context("Failed to serialize payload")?,
        result: record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize result")?,
        created_at: record.created_at.to_rfc3339(),
        updated_at: record.updated_at.to_rfc3339(),
        started_at: record.started_at.map(|t| t.to_rfc3339()),
        completed_at: record.completed_at.map(|t| t.to_rfc3339()),
    })
}

/// Raw row; decoded outside the rusqlite closure so errors carry context
struct RawRow {
    id: String,
    owner_id: String,
    kind: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    queue_job_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    last_error: Option<String>,
    cancel_requested: bool,
    payload: String,
    result: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            queue_job_id: row.get(6)?,
            error_code: row.get(7)?,
            error_message: row.get(8)?,
            last_error: row.get(9)?,
            cancel_requested: row.get(10)?,
            payload: row.get(11)?,
            result: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            started_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    }

    fn decode(self) -> Result<JobRecord> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("job {} has unknown status '{}'", self.id, self.status))?;

        Ok(JobRecord {
            status,
            attempts: u32::try_from(self.attempts).context("attempts out of range")?,
            max_attempts: u32::try_from(self.max_attempts).context("max_attempts out of range")?,
            payload: serde_json::from_str(&self.payload).context("Failed to parse payload")?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse result")?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            id: self.id,
            owner_id: self.owner_id,
            kind: self.kind,
            queue_job_id: self.queue_job_id,
            error_code: self.error_code,
            error_message: self.error_message,
            last_error: self.last_error,
            cancel_requested: self.cancel_requested,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

impl JobRepository for SqliteJobStore {
    fn insert(&self, record: &JobRecord) -> Result<()> {
        let e = encode(record)?;
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO jobs ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    COLUMNS
                ),
                params![
                    record.id,
                    record.owner_id,
                    record.kind,
                    record.status.as_str(),
                    record.attempts,
                    record.max_attempts,
                    record.queue_job_id,
                    record.error_code,
                    record.error_message,
                    record.last_error,
                    record.cancel_requested,
                    e.payload,
                    e.result,
                    e.created_at,
                    e.updated_at,
                    e.started_at,
                    e.completed_at,
                ],
            )
            .with_context(|| format!("Failed to insert job {}", record.id))?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", COLUMNS),
                params![id],
                RawRow::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to load job {}", id))?;
        raw.map(RawRow::decode).transpose()
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        let conn = self.conn()?;
        let rows = update(&conn, record, None)?;
        if rows == 0 {
            return Err(anyhow!("job {} does not exist", record.id));
        }
        Ok(())
    }

    fn conditional_update(&self, record: &JobRecord, expected: JobStatus) -> Result<bool> {
        let conn = self.conn()?;
        let rows = update(&conn, record, Some(expected))?;
        Ok(rows == 1)
    }

    fn request_cancel(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
                 WHERE id = ?1 AND status IN ('queued', 'processing')",
                params![id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to request cancel for job {}", id))?;
        Ok(rows > 0)
    }

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<JobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC",
                COLUMNS
            ))
            .context("Failed to prepare list_by_owner query")?;

        let rows = stmt
            .query_map(params![owner_id], RawRow::from_row)
            .context("Failed to query jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read job rows")?;

        rows.into_iter().map(RawRow::decode).collect()
    }
}

/// UPDATE every mutable column; with `expected`, only if the stored status matches.
/// A cancellation request, once stored, is never cleared by a later write.
fn update(conn: &Connection, record: &JobRecord, expected: Option<JobStatus>) -> Result<usize> {
    let e = encode(record)?;
    let rows = conn
        .execute(
            "UPDATE jobs SET
                status = ?2, attempts = ?3, max_attempts = ?4, queue_job_id = ?5,
                error_code = ?6, error_message = ?7, last_error = ?8,
                cancel_requested = MAX(cancel_requested, ?9), result = ?10, updated_at = ?11,
                started_at = ?12, completed_at = ?13
             WHERE id = ?1 AND (?14 IS NULL OR status = ?14)",
            params![
                record.id,
                record.status.as_str(),
                record.attempts,
                record.max_attempts,
                record.queue_job_id,
                record.error_code,
                record.error_message,
                record.last_error,
                record.cancel_requested,
                e.result,
                e.updated_at,
                e.started_at,
                e.completed_at,
                expected.map(|s| s.as_str()),
            ],
        )
        .with_context(|| format!("Failed to update job {}", record.id))?;
    Ok(rows)
}
