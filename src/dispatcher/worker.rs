use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::HandlerRegistry;
use crate::config::JobsConfig;
use crate::jobs::{JobContext, JobError, JobStatus, RetryPolicy, Transition};
use crate::queue::{Delivery, JobQueue};
use crate::store::JobRepository;

/// Why a delivery was dropped without running anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No record for the job id
    MissingRecord,
    /// Delivery id differs from the one recorded at enqueue
    StaleDelivery,
    /// Record already completed or failed
    AlreadyFinished,
    /// Another worker holds the current attempt
    AlreadyProcessing,
    /// Lost the queued→processing race
    ClaimLost,
    /// Record left `processing` while the handler ran
    Conflict,
}

/// What one `run_once` call did
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Idle,
    Discarded(DiscardReason),
    Cancelled { job_id: String },
    Completed { job_id: String },
    Retrying { job_id: String, attempts: u32, delay: Duration },
    Failed { job_id: String, error_code: String },
}

/// Pulls deliveries and drives job records through the state machine.
///
/// One job is processed at a time; run several workers for parallelism.
pub struct Worker {
    store: Arc<dyn JobRepository>,
    queue: Arc<dyn JobQueue>,
    handlers: HandlerRegistry,
    policy: RetryPolicy,
    handler_timeout: Duration,
    pull_wait: Duration,
    error_pause: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobRepository>,
        queue: Arc<dyn JobQueue>,
        handlers: HandlerRegistry,
    ) -> Self {
        let jobs = JobsConfig::default();
        Self {
            store,
            queue,
            handlers,
            policy: jobs.retry_policy(),
            handler_timeout: jobs.handler_timeout(),
            pull_wait: Duration::from_secs(5),
            error_pause: Duration::from_secs(1),
        }
    }

    pub fn with_jobs_config(mut self, config: &JobsConfig) -> Self {
        self.policy = config.retry_policy();
        self.handler_timeout = config.handler_timeout();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_pull_wait(mut self, wait: Duration) -> Self {
        self.pull_wait = wait;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    /// Process deliveries until `shutdown` flips to true.
    ///
    /// The flag is checked between jobs; an in-flight handler always runs to
    /// completion. Store and queue errors are logged and followed by a short
    /// pause, never propagated.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(kinds = ?self.handlers.kinds(), "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(WorkerOutcome::Idle) => {}
                Ok(outcome) => debug!(?outcome, "Delivery processed"),
                Err(e) => {
                    error!(error = %e, "Worker iteration failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_pause) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Pull at most one delivery and process it.
    pub async fn run_once(&self) -> Result<WorkerOutcome> {
        match self.queue.pull(self.pull_wait).await? {
            Some(delivery) => self.process(delivery).await,
            None => Ok(WorkerOutcome::Idle),
        }
    }

    async fn process(&self, delivery: Box<dyn Delivery>) -> Result<WorkerOutcome> {
        let job_id = delivery.message().job_id.clone();
        let queue_job_id = delivery.queue_job_id().to_string();

        let Some(record) = self.store.load(&job_id)? else {
            warn!(job_id = %job_id, queue_job_id = %queue_job_id, "No record for delivered job");
            return discard(delivery, DiscardReason::MissingRecord).await;
        };

        if let Some(expected) = &record.queue_job_id {
            if *expected != queue_job_id {
                debug!(
                    job_id = %job_id,
                    expected = %expected,
                    actual = %queue_job_id,
                    "Stale delivery"
                );
                return discard(delivery, DiscardReason::StaleDelivery).await;
            }
        }

        match record.status {
            JobStatus::Completed | JobStatus::Failed => {
                debug!(job_id = %job_id, status = %record.status, "Job already finished");
                return discard(delivery, DiscardReason::AlreadyFinished).await;
            }
            JobStatus::Processing => {
                debug!(job_id = %job_id, "Job already being processed");
                return discard(delivery, DiscardReason::AlreadyProcessing).await;
            }
            JobStatus::Queued => {}
        }

        if record.cancel_requested {
            let cancelled = record.cancelled(Utc::now())?;
            if !self.store.conditional_update(&cancelled, JobStatus::Queued)? {
                return discard(delivery, DiscardReason::ClaimLost).await;
            }
            info!(job_id = %job_id, "Job cancelled");
            delivery.ack().await?;
            return Ok(WorkerOutcome::Cancelled { job_id });
        }

        let Some((kind, handler)) = self.handlers.resolve(&record.kind) else {
            let failed = record.failed_with(
                "unknown_job_kind",
                format!("no handler registered for kind '{}'", record.kind),
                Utc::now(),
            )?;
            if !self.store.conditional_update(&failed, JobStatus::Queued)? {
                return discard(delivery, DiscardReason::ClaimLost).await;
            }
            warn!(job_id = %job_id, kind = %record.kind, "Unknown job kind");
            delivery.ack().await?;
            return Ok(WorkerOutcome::Failed {
                job_id,
                error_code: "unknown_job_kind".to_string(),
            });
        };

        let claimed = record.claimed(Utc::now())?;
        if !self.store.conditional_update(&claimed, JobStatus::Queued)? {
            debug!(job_id = %job_id, "Claim lost to another worker");
            return discard(delivery, DiscardReason::ClaimLost).await;
        }

        let ctx = JobContext::for_record(&record, kind);
        info!(
            job_id = %job_id,
            kind = %kind,
            attempt = ctx.attempt,
            max_attempts = record.max_attempts,
            "Processing job"
        );

        let run = AssertUnwindSafe(handler.handle(&ctx, &claimed.payload)).catch_unwind();
        let outcome = match tokio::time::timeout(self.handler_timeout, run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job_id, kind = %kind, panic = %message, "Handler panicked");
                Err(JobError::panicked(message))
            }
            Err(_) => Err(JobError::timeout(self.handler_timeout)),
        };

        let transition = claimed.apply(outcome, &self.policy, Utc::now())?;
        if !self
            .store
            .conditional_update(transition.record(), JobStatus::Processing)?
        {
            warn!(job_id = %job_id, "Job record changed while processing, dropping outcome");
            return discard(delivery, DiscardReason::Conflict).await;
        }

        match transition {
            Transition::Completed(_) => {
                info!(job_id = %job_id, "Job completed");
                delivery.ack().await?;
                Ok(WorkerOutcome::Completed { job_id })
            }
            Transition::Retry { record, delay } => {
                warn!(
                    job_id = %job_id,
                    attempts = record.attempts,
                    max_attempts = record.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    last_error = record.last_error.as_deref().unwrap_or_default(),
                    "Job failed transiently, retrying"
                );
                delivery.retry_after(delay).await?;
                Ok(WorkerOutcome::Retrying {
                    job_id,
                    attempts: record.attempts,
                    delay,
                })
            }
            Transition::Failed(record) => {
                let error_code = record.error_code.unwrap_or_default();
                warn!(
                    job_id = %job_id,
                    error_code = %error_code,
                    error = record.error_message.as_deref().unwrap_or_default(),
                    attempts = record.attempts,
                    "Job failed"
                );
                delivery.ack().await?;
                Ok(WorkerOutcome::Failed { job_id, error_code })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn discard(delivery: Box<dyn Delivery>, reason: DiscardReason) -> Result<WorkerOutcome> {
    delivery.ack().await?;
    Ok(WorkerOutcome::Discarded(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{JobHandler, QueueDispatcher};
    use crate::jobs::{JobKind, JobRecord};
    use crate::queue::{MemoryJobQueue, QueueMessage};
    use crate::store::SqliteJobStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of outcomes, then succeeds
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<Value, JobError>>>,
        delay: Duration,
        calls: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Value, JobError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::new()),
                delay,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn attempts_seen(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn kind(&self) -> JobKind {
            JobKind::Transcript
        }

        async fn handle(&self, ctx: &JobContext, _payload: &Value) -> Result<Value, JobError> {
            self.calls.lock().unwrap().push(ctx.attempt);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(json!({"text": "done"})))
        }
    }

    struct Harness {
        store: Arc<SqliteJobStore>,
        queue: MemoryJobQueue,
        dispatcher: QueueDispatcher,
        worker: Worker,
    }

    fn harness(handler: Arc<Scripted>) -> Harness {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let queue = MemoryJobQueue::new();
        let dispatcher = QueueDispatcher::new(store.clone(), Arc::new(queue.clone()));
        let worker = Worker::new(
            store.clone(),
            Arc::new(queue.clone()),
            HandlerRegistry::new().with_handler(handler),
        )
        .with_retry_policy(RetryPolicy::new(Duration::ZERO, Duration::ZERO))
        .with_pull_wait(Duration::from_millis(20));

        Harness {
            store,
            queue,
            dispatcher,
            worker,
        }
    }

    fn transcript_job(max_attempts: u32) -> JobRecord {
        JobRecord::new(
            "user-1",
            JobKind::Transcript,
            json!({"video_url": "https://youtu.be/abc"}),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let h = harness(Scripted::new(vec![]));
        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed { job_id: id.clone() });

        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!({"text": "done"})));
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(h.queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_max_attempts() {
        let timeout = || -> Result<Value, JobError> { Err(JobError::transient("timeout", "upstream slow")) };
        let handler = Scripted::new(vec![timeout(), timeout(), timeout()]);
        let h = harness(handler.clone());
        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        for attempts in 1..=2 {
            match h.worker.run_once().await.unwrap() {
                WorkerOutcome::Retrying { attempts: seen, .. } => assert_eq!(seen, attempts),
                other => panic!("expected retry, got {:?}", other),
            }
            let stored = h.store.load(&id).unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Queued);
            assert_eq!(stored.attempts, attempts);
        }

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                job_id: id.clone(),
                error_code: "max_attempts_exceeded".to_string()
            }
        );

        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert_eq!(handler.attempts_seen(), vec![1, 2, 3]);
        assert_eq!(h.queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_consume_attempts() {
        let h = harness(Scripted::new(vec![Err(JobError::invalid_payload("video_url missing"))]));
        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                job_id: id.clone(),
                error_code: "invalid_payload".to_string()
            }
        );

        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.error_message.as_deref(), Some("video_url missing"));
        assert!(h.worker.run_once().await.unwrap() == WorkerOutcome::Idle);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_running() {
        let handler = Scripted::new(vec![]);
        let h = harness(handler.clone());
        let mut job = transcript_job(3);
        job.kind = "podcast_clip".to_string();
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                job_id: id.clone(),
                error_code: "unknown_job_kind".to_string()
            }
        );
        assert!(handler.attempts_seen().is_empty());
        assert_eq!(h.store.load(&id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_processing() {
        let handler = Scripted::new(vec![]);
        let h = harness(handler.clone());
        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();
        h.dispatcher.cancel(&id).unwrap();

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Cancelled { job_id: id.clone() });

        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some("cancelled"));
        assert!(handler.attempts_seen().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_observed_on_next_retry() {
        let handler = Scripted::new(vec![Err(JobError::transient("rate_limited", "429"))]);
        let h = harness(handler.clone());
        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        assert!(matches!(
            h.worker.run_once().await.unwrap(),
            WorkerOutcome::Retrying { .. }
        ));
        h.dispatcher.cancel(&id).unwrap();

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Cancelled { job_id: id.clone() });
        assert_eq!(handler.attempts_seen(), vec![1]);

        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_code.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_is_discarded() {
        let handler = Scripted::new(vec![]);
        let h = harness(handler.clone());
        let job = transcript_job(3);
        let id = job.id.clone();
        let queue_job_id = h.dispatcher.enqueue(job).await.unwrap();

        h.worker.run_once().await.unwrap();

        let message = QueueMessage::new(&id, "transcript");
        h.queue.redeliver(&queue_job_id, message.clone()).unwrap();
        assert_eq!(
            h.worker.run_once().await.unwrap(),
            WorkerOutcome::Discarded(DiscardReason::AlreadyFinished)
        );

        h.queue.redeliver("memory:999", message).unwrap();
        assert_eq!(
            h.worker.run_once().await.unwrap(),
            WorkerOutcome::Discarded(DiscardReason::StaleDelivery)
        );
        assert_eq!(handler.attempts_seen(), vec![1]);
    }

    #[tokio::test]
    async fn test_delivery_for_processing_job_is_discarded() {
        let handler = Scripted::new(vec![]);
        let h = harness(handler.clone());
        let job = transcript_job(3);
        let id = job.id.clone();
        let queue_job_id = h.dispatcher.enqueue(job).await.unwrap();

        // Another worker claimed it
        let stored = h.store.load(&id).unwrap().unwrap();
        let claimed = stored.claimed(Utc::now()).unwrap();
        assert!(h.store.conditional_update(&claimed, JobStatus::Queued).unwrap());

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Discarded(DiscardReason::AlreadyProcessing));
        assert!(handler.attempts_seen().is_empty());
        assert_eq!(claimed.queue_job_id.as_deref(), Some(queue_job_id.as_str()));
    }

    #[tokio::test]
    async fn test_missing_record_is_discarded() {
        let h = harness(Scripted::new(vec![]));
        h.queue
            .redeliver("memory:1", QueueMessage::new("ghost", "transcript"))
            .unwrap();

        assert_eq!(
            h.worker.run_once().await.unwrap(),
            WorkerOutcome::Discarded(DiscardReason::MissingRecord)
        );
        assert_eq!(h.queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_handler_timeout_is_transient() {
        let h = harness(Scripted::new(vec![]));
        let worker = Worker::new(
            h.store.clone(),
            Arc::new(h.queue.clone()),
            HandlerRegistry::new().with_handler(Scripted::slow(Duration::from_millis(500))),
        )
        .with_retry_policy(RetryPolicy::new(Duration::ZERO, Duration::ZERO))
        .with_handler_timeout(Duration::from_millis(20))
        .with_pull_wait(Duration::from_millis(20));

        let job = transcript_job(2);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        match worker.run_once().await.unwrap() {
            WorkerOutcome::Retrying { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected retry, got {:?}", other),
        }
        let stored = h.store.load(&id).unwrap().unwrap();
        assert!(stored.last_error.unwrap().starts_with("timeout"));
    }

    struct Exploding;

    #[async_trait]
    impl JobHandler for Exploding {
        fn kind(&self) -> JobKind {
            JobKind::Transcript
        }

        async fn handle(&self, _ctx: &JobContext, payload: &Value) -> Result<Value, JobError> {
            let segments = payload["segments"].as_array().map(Vec::len).unwrap_or(0);
            panic!("segment index {} out of range", segments + 1);
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_job_and_worker_survives() {
        let h = harness(Scripted::new(vec![]));
        let worker = Worker::new(
            h.store.clone(),
            Arc::new(h.queue.clone()),
            HandlerRegistry::new().with_handler(Arc::new(Exploding)),
        )
        .with_pull_wait(Duration::from_millis(20));

        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        assert_eq!(
            worker.run_once().await.unwrap(),
            WorkerOutcome::Failed {
                job_id: id.clone(),
                error_code: "handler_panicked".to_string()
            }
        );
        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("segment index 1 out of range")
        );
        assert_eq!(h.queue.pending(), 0);

        let next = transcript_job(3);
        h.dispatcher.enqueue(next).await.unwrap();
        assert!(matches!(
            worker.run_once().await.unwrap(),
            WorkerOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "handler panicked");
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let h = harness(Scripted::new(vec![]));
        assert_eq!(h.worker.run_once().await.unwrap(), WorkerOutcome::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(Scripted::new(vec![]));
        let job = transcript_job(3);
        let id = job.id.clone();
        h.dispatcher.enqueue(job).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(h.worker);
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(rx).await })
        };

        for _ in 0..100 {
            if h.store.load(&id).unwrap().unwrap().status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.store.load(&id).unwrap().unwrap().status, JobStatus::Completed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
