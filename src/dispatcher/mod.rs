//! Job dispatch: handler registry, enqueue side and the worker loop.

mod worker;

pub use worker::{DiscardReason, Worker, WorkerOutcome};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::jobs::{JobContext, JobError, JobKind, JobRecord, JobStatus};
use crate::queue::{JobQueue, QueueMessage};
use crate::store::JobRepository;

/// Executes one kind of job.
///
/// Handlers see the payload and return a JSON result or a classified
/// [`JobError`]. They never touch the job record; the worker owns it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn handle(&self, ctx: &JobContext, payload: &Value) -> Result<Value, JobError>;
}

/// Handlers keyed by job kind
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own kind, replacing any earlier one.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    /// Look up the handler for a persisted kind string
    pub fn resolve(&self, kind: &str) -> Option<(JobKind, Arc<dyn JobHandler>)> {
        let kind = JobKind::parse(kind)?;
        self.handlers.get(&kind).map(|handler| (kind, Arc::clone(handler)))
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }
}

/// Enqueue side of the pipeline, plus status polling and cancellation.
#[derive(Clone)]
pub struct QueueDispatcher {
    store: Arc<dyn JobRepository>,
    queue: Arc<dyn JobQueue>,
}

impl QueueDispatcher {
    pub fn new(store: Arc<dyn JobRepository>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Persist `record` as `queued`, push a reference to it and record the
    /// queue id on the stored record. Returns the queue id.
    ///
    /// If the push fails the record is failed with `enqueue_failed` so it
    /// does not sit in `queued` forever.
    pub async fn enqueue(&self, record: JobRecord) -> Result<String> {
        if record.status != JobStatus::Queued {
            bail!(
                "job {} must be queued to enqueue, is '{}'",
                record.id,
                record.status
            );
        }

        self.store.insert(&record)?;

        let message = QueueMessage::new(&record.id, &record.kind);
        let queue_job_id = match self.queue.push(&message).await {
            Ok(queue_job_id) => queue_job_id,
            Err(e) => {
                error!(job_id = %record.id, error = %e, "Failed to push job");
                let failed = record.failed_with("enqueue_failed", e.to_string(), Utc::now())?;
                self.store.conditional_update(&failed, JobStatus::Queued)?;
                return Err(e);
            }
        };

        // A fast worker may already have claimed it; its write wins
        let correlated = record.with_queue_job_id(&queue_job_id);
        if !self.store.conditional_update(&correlated, JobStatus::Queued)? {
            info!(job_id = %record.id, "Job left queued before its queue id was recorded");
        }

        info!(
            job_id = %record.id,
            kind = %record.kind,
            owner_id = %record.owner_id,
            queue_job_id = %queue_job_id,
            "Job enqueued"
        );
        Ok(queue_job_id)
    }

    /// Request cooperative cancellation. The next delivery of a still-queued
    /// job fails it with `cancelled`; a running attempt is not interrupted.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let flagged = self.store.request_cancel(job_id)?;
        if flagged {
            info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(flagged)
    }

    pub fn status(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.store.load(job_id)
    }

    pub fn jobs_for(&self, owner_id: &str) -> Result<Vec<JobRecord>> {
        self.store.list_by_owner(owner_id)
    }
}
