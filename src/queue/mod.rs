//! Durable, at-least-once job queue.
//!
//! Messages only reference a job (`{job_id, job_kind}`); all mutable state
//! lives in the job store, so a redelivery always reads current state.

mod memory;
mod nats;

pub use memory::MemoryJobQueue;
pub use nats::{NatsJobQueue, NatsQueueConfig};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: String,
    pub job_kind: String,
}

impl QueueMessage {
    pub fn new(job_id: impl Into<String>, job_kind: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_kind: job_kind.into(),
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Push a message and return its queue-assigned id.
    async fn push(&self, message: &QueueMessage) -> Result<String>;

    /// Wait up to `wait` for the next delivery.
    async fn pull(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>>;
}

/// One delivery of a queue message.
///
/// A delivery must be settled with `ack` or `retry_after`. An unsettled
/// delivery is redelivered by the queue once its visibility timeout lapses.
#[async_trait]
pub trait Delivery: Send {
    fn message(&self) -> &QueueMessage;

    /// Stable across redeliveries of the same pushed message
    fn queue_job_id(&self) -> &str;

    /// Remove the message from the queue.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Put the message back, visible again after `delay`.
    async fn retry_after(self: Box<Self>, delay: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let message = QueueMessage::new("0192f0a4-job", "transcript");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"job_id": "0192f0a4-job", "job_kind": "transcript"})
        );

        let parsed: QueueMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }
}
