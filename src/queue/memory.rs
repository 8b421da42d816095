use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, JobQueue, QueueMessage};

#[derive(Debug, Clone)]
struct Entry {
    queue_job_id: String,
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<Entry>,
    next_sequence: u64,
    in_flight: usize,
}

/// In-process job queue with delayed redelivery.
///
/// A delivery dropped without being settled goes straight back on the queue,
/// standing in for a broker's visibility timeout.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting, visible or delayed, excluding ones being processed
    pub fn pending(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().map(|inner| inner.in_flight).unwrap_or(0)
    }

    /// Push a copy of an already-delivered message under the same id
    ///
    /// Simulates a broker redelivering an entry the worker already settled.
    pub fn redeliver(&self, queue_job_id: &str, message: QueueMessage) -> Result<()> {
        self.requeue(
            Entry {
                queue_job_id: queue_job_id.to_string(),
                message,
                visible_at: Instant::now(),
            },
            false,
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory queue mutex poisoned"))
    }

    fn requeue(&self, entry: Entry, settles_in_flight: bool) -> Result<()> {
        {
            let mut inner = self.lock()?;
            if settles_in_flight {
                inner.in_flight = inner.in_flight.saturating_sub(1);
            }
            inner.entries.push_back(entry);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn settle(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        Ok(())
    }

    /// Take the first visible entry, or report when the next one becomes visible
    fn take_visible(&self, now: Instant) -> Result<std::result::Result<Entry, Option<Instant>>> {
        let mut inner = self.lock()?;
        if let Some(index) = inner.entries.iter().position(|e| e.visible_at <= now) {
            if let Some(entry) = inner.entries.remove(index) {
                inner.in_flight += 1;
                return Ok(Ok(entry));
            }
        }
        Ok(Err(inner.entries.iter().map(|e| e.visible_at).min()))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, message: &QueueMessage) -> Result<String> {
        let queue_job_id = {
            let mut inner = self.lock()?;
            inner.next_sequence += 1;
            let queue_job_id = format!("memory:{}", inner.next_sequence);
            inner.entries.push_back(Entry {
                queue_job_id: queue_job_id.clone(),
                message: message.clone(),
                visible_at: Instant::now(),
            });
            queue_job_id
        };
        self.notify.notify_waiters();
        Ok(queue_job_id)
    }

    async fn pull(&self, wait: Duration) -> Result<Option<Box<dyn Delivery>>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let wake_at = match self.take_visible(now)? {
                Ok(entry) => {
                    return Ok(Some(Box::new(MemoryDelivery {
                        queue: self.clone(),
                        entry,
                        settled: false,
                    })));
                }
                Err(next_visible) => next_visible.map_or(deadline, |at| at.min(deadline)),
            };

            if now >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

struct MemoryDelivery {
    queue: MemoryJobQueue,
    entry: Entry,
    settled: bool,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn message(&self) -> &QueueMessage {
        &self.entry.message
    }

    fn queue_job_id(&self) -> &str {
        &self.entry.queue_job_id
    }

    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.settled = true;
        self.queue.settle()
    }

    async fn retry_after(mut self: Box<Self>, delay: Duration) -> Result<()> {
        self.settled = true;
        let entry = Entry {
            visible_at: Instant::now() + delay,
            ..self.entry.clone()
        };
        self.queue.requeue(entry, true)
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if !self.settled {
            let entry = Entry {
                visible_at: Instant::now(),
                ..self.entry.clone()
            };
            let _ = self.queue.requeue(entry, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> QueueMessage {
        QueueMessage::new(id, "transcript")
    }

    #[tokio::test]
    async fn test_push_and_pull_in_order() {
        let queue = MemoryJobQueue::new();
        let first = queue.push(&message("a")).await.unwrap();
        let second = queue.push(&message("b")).await.unwrap();
        assert_ne!(first, second);

        let delivery = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.message().job_id, "a");
        assert_eq!(delivery.queue_job_id(), first);
        assert_eq!(queue.in_flight(), 1);
        delivery.ack().await.unwrap();

        let delivery = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.message().job_id, "b");
        delivery.ack().await.unwrap();

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pull_times_out_when_empty() {
        let queue = MemoryJobQueue::new();
        let started = Instant::now();
        let delivery = queue.pull(Duration::from_millis(50)).await.unwrap();
        assert!(delivery.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pull_wakes_on_push() {
        let queue = MemoryJobQueue::new();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(&message("late")).await.unwrap();
        });

        let delivery = queue.pull(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(delivery.message().job_id, "late");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_after_delays_redelivery() {
        let queue = MemoryJobQueue::new();
        let id = queue.push(&message("a")).await.unwrap();

        let delivery = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        delivery.retry_after(Duration::from_millis(100)).await.unwrap();
        assert_eq!(queue.pending(), 1);

        assert!(queue.pull(Duration::from_millis(20)).await.unwrap().is_none());

        let redelivered = queue.pull(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(redelivered.queue_job_id(), id);
        redelivered.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let queue = MemoryJobQueue::new();
        let id = queue.push(&message("a")).await.unwrap();

        let delivery = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        drop(delivery);
        assert_eq!(queue.in_flight(), 0);

        let again = queue.pull(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.queue_job_id(), id);
        again.ack().await.unwrap();
    }
}
