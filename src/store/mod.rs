//! Job persistence.
//!
//! The store is the single source of truth for job status; the queue only
//! delivers references. Everything above this module talks to the
//! [`JobRepository`] trait.

mod sqlite;

pub use sqlite::SqliteJobStore;

use anyhow::Result;

use crate::jobs::{JobRecord, JobStatus};

pub trait JobRepository: Send + Sync {
    /// Insert a new record. Fails if the id already exists.
    fn insert(&self, record: &JobRecord) -> Result<()>;

    fn load(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Unconditional overwrite of an existing record.
    fn save(&self, record: &JobRecord) -> Result<()>;

    /// Write `record` only if the stored status is still `expected`.
    ///
    /// Returns whether a row changed. This is the claim primitive: of two
    /// concurrent queued→processing updates exactly one returns `true`.
    fn conditional_update(&self, record: &JobRecord, expected: JobStatus) -> Result<bool>;

    /// Flag a non-terminal job for cancellation. Returns whether it was flagged.
    fn request_cancel(&self, id: &str) -> Result<bool>;

    /// All jobs of an owner, newest first.
    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<JobRecord>>;
}
