use anyhow::{anyhow, Context, Result};
use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::{self, consumer::pull, stream, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Delivery, JobQueue, QueueMessage};

/// JetStream work-queue configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsQueueConfig {
    pub url: String,
    pub stream_name: String,
    /// Messages are published on `{subject_prefix}.{job_kind}`
    pub subject_prefix: String,
    /// Durable pull consumer shared by every worker
    pub consumer_name: String,
    /// Visibility timeout: unacked deliveries come back after this long
    pub ack_wait_seconds: u64,
    pub pull_wait_seconds: u64,
    /// Bound on connect and publish round-trips
    pub request_timeout_seconds: u64,
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "CREATORLINK_JOBS".to_string(),
            subject_prefix: "creatorlink.jobs".to_string(),
            consumer_name: "creatorlink-worker".to_string(),
            ack_wait_seconds: 600,
            pull_wait_seconds: 5,
            request_timeout_seconds: 10,
        }
    }
}

impl NatsQueueConfig {
    pub fn pull_wait(&self) -> Duration {
        Duration::from_secs(self.pull_wait_seconds)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    fn subject(&self, job_kind: &str) -> String {
        format!("{}.{}", self.subject_prefix, job_kind)
    }
}

/// Job queue on a JetStream work-queue stream with one durable pull consumer.
pub struct NatsJobQueue {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumer: jetstream::consumer::Consumer<pull::Config>,
    config: NatsQueueConfig,
}

impl NatsJobQueue {
    /// Connect, then ensure the stream and the durable consumer exist.
    ///
    /// Fails if the broker is unreachable within the request timeout.
    pub async fn connect(config: NatsQueueConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.request_timeout())
            .connect(&config.url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", config.url))?;

        let jetstream = jetstream::new(client.clone());

        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", config.subject_prefix)],
                retention: stream::RetentionPolicy::WorkQueue,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow!("Failed to ensure stream '{}': {}", config.stream_name, e))?;

        let consumer = stream
            .get_or_create_consumer(
                &config.consumer_name,
                pull::Config {
                    durable_name: Some(config.consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(config.ack_wait_seconds),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow!("Failed to ensure consumer '{}': {}", config.consumer_name, e))?;

        info!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            "Job queue ready"
        );

        Ok(Self {
            client,
            jetstream,
            consumer,
            config,
        })
    }

    /// Flush pending publishes before shutdown
    pub async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| anyhow!("Failed to flush NATS connection: {}", e))
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn push(&self, message: &QueueMessage) -> Result<String> {
        let payload = serde_json::to_vec(message).context("Failed to serialize queue message")?;

        // Broker-side dedup of double enqueues within the duplicate window
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, message.job_id.as_str());

        let publish = async {
            self.jetstream
                .publish_with_headers(self.config.subject(&message.job_kind), headers, payload.into())
                .await
                .map_err(|e| anyhow!("Failed to publish job {}: {}", message.job_id, e))?
                .await
                .map_err(|e| anyhow!("Publish of job {} not acknowledged: {}", message.job_id, e))
        };

        let ack = tokio::time::timeout(self.config.request_timeout(), publish)
            .await
            .map_err(|_| anyhow!("Timed out publishing job {}", message.job_id))??;

        let queue_job_id = format!("{}:{}", ack.stream, ack.sequence);
        debug!(
            job_id = %message.job_id,
            queue_job_id = %queue_job_id,
            duplicate = ack.duplicate,
            "Job published"
        );
        Ok(queue_job_id)
    }

    async fn pull(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| anyhow!("Failed to request batch: {}", e))?;

        let Some(next) = batch.next().await else {
            return Ok(None);
        };
        let msg = next.map_err(|e| anyhow!("Failed to receive message: {}", e))?;

        let queue_job_id = {
            let info = msg
                .info()
                .map_err(|e| anyhow!("Message without JetStream metadata: {}", e))?;
            format!("{}:{}", info.stream, info.stream_sequence)
        };

        let message: QueueMessage = match serde_json::from_slice(&msg.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue_job_id = %queue_job_id, error = %e, "Dropping malformed queue message");
                msg.ack_with(AckKind::Term)
                    .await
                    .map_err(|e| anyhow!("Failed to terminate message: {}", e))?;
                return Ok(None);
            }
        };

        Ok(Some(Box::new(NatsDelivery {
            msg,
            message,
            queue_job_id,
        })))
    }
}

struct NatsDelivery {
    msg: jetstream::Message,
    message: QueueMessage,
    queue_job_id: String,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn message(&self) -> &QueueMessage {
        &self.message
    }

    fn queue_job_id(&self) -> &str {
        &self.queue_job_id
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.msg
            .ack()
            .await
            .map_err(|e| anyhow!("Failed to ack {}: {}", self.queue_job_id, e))
    }

    async fn retry_after(self: Box<Self>, delay: Duration) -> Result<()> {
        self.msg
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| anyhow!("Failed to nak {}: {}", self.queue_job_id, e))
    }
}
