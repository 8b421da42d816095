//! Retryable job records.
//!
//! A [`JobRecord`] moves `queued → processing → {completed, failed}`. The only
//! backward edge is a transient failure with attempts left, which returns the
//! record to `queued` for redelivery. Every transition produces a new record;
//! the input is never modified.

mod error;
mod machine;
pub mod retry;

pub use error::{ErrorClass, JobError};
pub use machine::{InvalidTransition, Transition};
pub use retry::RetryPolicy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status persisted with every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transcript,
    AutoIngest,
    RepostPackage,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Transcript, JobKind::AutoIngest, JobKind::RepostPackage];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcript => "transcript",
            JobKind::AutoIngest => "auto_ingest",
            JobKind::RepostPackage => "repost_package",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one unit of work.
///
/// `kind` is kept as a string so records written by newer producers still
/// load; the worker fails them with `unknown_job_kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub owner_id: String,
    pub kind: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub queue_job_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Most recent transient failure, informational only
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub payload: Value,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// New `queued` record with a UUID v7 id. `max_attempts` is at least 1.
    pub fn new(owner_id: impl Into<String>, kind: JobKind, payload: Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            owner_id: owner_id.into(),
            kind: kind.as_str().to_string(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            queue_job_id: None,
            error_code: None,
            error_message: None,
            last_error: None,
            cancel_requested: false,
            payload,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn job_kind(&self) -> Option<JobKind> {
        JobKind::parse(&self.kind)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy with the queue correlation id recorded
    pub fn with_queue_job_id(&self, queue_job_id: impl Into<String>) -> Self {
        Self {
            queue_job_id: Some(queue_job_id.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// What a handler gets to know about the job it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    pub owner_id: String,
    pub kind: JobKind,
    /// 1-based attempt number of this run
    pub attempt: u32,
}

impl JobContext {
    pub fn for_record(record: &JobRecord, kind: JobKind) -> Self {
        Self {
            job_id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            kind,
            attempt: record.attempts + 1,
        }
    }
}
