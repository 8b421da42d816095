//! End-to-end: dispatcher → memory queue → worker → real handlers → mock processor.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use creatorlink::accounts::AccountStore;
use creatorlink::config::ProcessorConfig;
use creatorlink::connectors::StateManager;
use creatorlink::dispatcher::WorkerOutcome;
use creatorlink::queue::MemoryJobQueue;
use creatorlink::store::SqliteJobStore;
use creatorlink::{ConnectorRegistry, JobKind, JobRecord, JobStatus, QueueDispatcher, RetryPolicy, Worker};
use creatorlink_worker::{registry, ProcessorClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    dispatcher: QueueDispatcher,
    worker: Worker,
    _dir: tempfile::TempDir,
}

fn pipeline(processor_url: &str) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteJobStore::open(dir.path().join("jobs.db")).unwrap());
    let accounts = Arc::new(
        AccountStore::open(dir.path().join("accounts.db"), &BASE64.encode([9u8; 32])).unwrap(),
    );
    let connectors = Arc::new(ConnectorRegistry::empty(StateManager::new(600)));
    let processor = Arc::new(
        ProcessorClient::new(&ProcessorConfig {
            base_url: processor_url.to_string(),
            timeout_seconds: 5,
        })
        .unwrap(),
    );

    let queue = MemoryJobQueue::new();
    let dispatcher = QueueDispatcher::new(store.clone(), Arc::new(queue.clone()));
    let worker = Worker::new(
        store,
        Arc::new(queue),
        registry(processor, accounts, connectors),
    )
    .with_retry_policy(RetryPolicy::new(Duration::ZERO, Duration::ZERO))
    .with_pull_wait(Duration::from_millis(50));

    Pipeline {
        dispatcher,
        worker,
        _dir: dir,
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
async fn test_transcript_job_recovers_from_outage() {
    let mut server = mockito::Server::new_async().await;
    let outage = server
        .mock("POST", "/transcripts")
        .with_status(503)
        .create_async()
        .await;

    let p = pipeline(&server.url());
    let job = transcript_job(3);
    let id = job.id.clone();
    p.dispatcher.enqueue(job).await.unwrap();

    assert!(matches!(
        p.worker.run_once().await.unwrap(),
        WorkerOutcome::Retrying { attempts: 1, .. }
    ));
    let stored = p.dispatcher.status(&id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert!(stored.last_error.unwrap().starts_with("upstream_unavailable"));

    outage.remove_async().await;
    let _ok = server
        .mock("POST", "/transcripts")
        .with_status(200)
        .with_body(r#"{"text": "hi there", "language": "en", "segments": [{}]}"#)
        .create_async()
        .await;

    assert_eq!(
        p.worker.run_once().await.unwrap(),
        WorkerOutcome::Completed { job_id: id.clone() }
    );

    let stored = p.dispatcher.status(&id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempts, 1);
    assert_eq!(
        stored.result,
        Some(json!({"text": "hi there", "language": "en", "segment_count": 1}))
    );
}

#[tokio::test]
async fn test_persistent_outage_exhausts_attempts() {
    let mut server = mockito::Server::new_async().await;
    let _outage = server
        .mock("POST", "/transcripts")
        .with_status(502)
        .expect(3)
        .create_async()
        .await;

    let p = pipeline(&server.url());
    let job = transcript_job(3);
    let id = job.id.clone();
    p.dispatcher.enqueue(job).await.unwrap();

    let mut last = WorkerOutcome::Idle;
    for _ in 0..3 {
        last = p.worker.run_once().await.unwrap();
    }
    assert_eq!(
        last,
        WorkerOutcome::Failed {
            job_id: id.clone(),
            error_code: "max_attempts_exceeded".to_string()
        }
    );

    let stored = p.dispatcher.status(&id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 3);
    assert!(stored.completed_at.is_some());
    assert_eq!(p.worker.run_once().await.unwrap(), WorkerOutcome::Idle);
}

#[tokio::test]
async fn test_rejected_request_fails_immediately() {
    let mut server = mockito::Server::new_async().await;
    let _rejected = server
        .mock("POST", "/repost-packages")
        .with_status(422)
        .with_body(r#"{"error": "source is private"}"#)
        .create_async()
        .await;

    let p = pipeline(&server.url());
    let job = JobRecord::new(
        "user-2",
        JobKind::RepostPackage,
        json!({"source_url": "https://instagram.com/p/xyz", "target_platforms": ["tiktok"]}),
        5,
    );
    let id = job.id.clone();
    p.dispatcher.enqueue(job).await.unwrap();

    assert_eq!(
        p.worker.run_once().await.unwrap(),
        WorkerOutcome::Failed {
            job_id: id.clone(),
            error_code: "rejected".to_string()
        }
    );
    let stored = p.dispatcher.status(&id).unwrap().unwrap();
    assert_eq!(stored.attempts, 0);
    assert!(stored.error_message.unwrap().contains("source is private"));
}

#[tokio::test]
async fn test_ingest_without_connector_fails_permanently() {
    let server = mockito::Server::new_async().await;
    let p = pipeline(&server.url());
    let job = JobRecord::new(
        "user-3",
        JobKind::AutoIngest,
        json!({"platform": "youtube", "handle": "@creator"}),
        3,
    );
    let id = job.id.clone();
    p.dispatcher.enqueue(job).await.unwrap();

    assert_eq!(
        p.worker.run_once().await.unwrap(),
        WorkerOutcome::Failed {
            job_id: id,
            error_code: "connector_unavailable".to_string()
        }
    );
}
