//! In-memory durable queue.
//!
//! Messages are FIFO within a group and at most one message per group is in
//! flight at a time. A negatively acknowledged message goes back to the head
//! of its group; once it has been received `max_receive_count` times it is
//! moved to the dead-letter list instead. In-flight messages that are neither
//! acknowledged nor returned within the visibility timeout become visible
//! again.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{DurableQueue, InfraError, QueueMessage};
use crate::channel::QueueRef;
use crate::message::generate_id;

/// Queue ARN prefix.
const QUEUE_ARN_PREFIX: &str = "arn:murmur:queue:";

/// Queue behaviour.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Receives before a message is dead-lettered.
    pub max_receive_count: u32,
    /// How long a received message stays invisible.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_receive_count: 5,
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    message_id: String,
    group_id: String,
    body: Bytes,
    receive_count: u32,
}

impl Pending {
    fn to_message(&self, receipt: &str) -> QueueMessage {
        QueueMessage {
            receipt: receipt.to_string(),
            message_id: self.message_id.clone(),
            group_id: self.group_id.clone(),
            body: self.body.clone(),
            receive_count: self.receive_count,
        }
    }
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Pending>,
    in_flight: HashMap<String, (Pending, Instant)>,
    busy_groups: HashSet<String>,
    dead: Vec<QueueMessage>,
}

impl QueueState {
    /// Put a message back at the head of its group, or dead-letter it.
    fn release(&mut self, queue: &QueueRef, receipt: &str, pending: Pending, max_receive_count: u32) {
        self.busy_groups.remove(&pending.group_id);
        if pending.receive_count >= max_receive_count {
            warn!(
                queue = %queue,
                message_id = %pending.message_id,
                receive_count = pending.receive_count,
                "Moving message to dead letters"
            );
            self.dead.push(pending.to_message(receipt));
        } else {
            // Nothing of this group was handed out meanwhile, so the head of
            // the deque keeps the group's order.
            self.waiting.push_front(pending);
        }
    }

    fn reclaim_expired(&mut self, queue: &QueueRef, now: Instant, max_receive_count: u32) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((pending, _)) = self.in_flight.remove(&receipt) {
                debug!(queue = %queue, message_id = %pending.message_id, "Visibility timeout expired");
                self.release(queue, &receipt, pending, max_receive_count);
            }
        }
    }

    fn take(&mut self, max: usize, visibility_timeout: Duration) -> Vec<QueueMessage> {
        let mut taken = Vec::new();
        let mut index = 0;
        while taken.len() < max && index < self.waiting.len() {
            if self.busy_groups.contains(&self.waiting[index].group_id) {
                index += 1;
                continue;
            }
            let Some(mut pending) = self.waiting.remove(index) else {
                break;
            };
            pending.receive_count += 1;
            let receipt = generate_id("rcpt");
            self.busy_groups.insert(pending.group_id.clone());
            taken.push(pending.to_message(&receipt));
            self.in_flight
                .insert(receipt, (pending, Instant::now() + visibility_timeout));
        }
        taken
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

/// Durable queue keeping messages in memory.
pub struct MemoryQueue {
    queues: DashMap<QueueRef, Arc<QueueInner>>,
    config: QueueConfig,
}

impl MemoryQueue {
    /// Create an empty queue service.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            queues: DashMap::new(),
            config,
        }
    }

    fn inner(&self, queue: &QueueRef) -> Result<Arc<QueueInner>, InfraError> {
        self.queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| InfraError::QueueNotFound(queue.to_string()))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn create_queue(&self, name: &str) -> Result<QueueRef, InfraError> {
        let queue = QueueRef::new(format!("{QUEUE_ARN_PREFIX}{name}"));
        self.queues.entry(queue.clone()).or_insert_with(|| {
            debug!(queue = %queue, "Created queue");
            Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            })
        });
        Ok(queue)
    }

    async fn delete_queue(&self, queue: &QueueRef) -> Result<(), InfraError> {
        if let Some((_, inner)) = self.queues.remove(queue) {
            inner.closed.store(true, Ordering::Release);
            inner.notify.notify_waiters();
            debug!(queue = %queue, "Deleted queue");
        }
        Ok(())
    }

    async fn queue_exists(&self, queue: &QueueRef) -> bool {
        self.queues.contains_key(queue)
    }

    async fn send(
        &self,
        queue: &QueueRef,
        group_id: &str,
        body: Bytes,
    ) -> Result<String, InfraError> {
        let inner = self.inner(queue)?;
        let message_id = generate_id("qmsg");
        inner.state.lock().await.waiting.push_back(Pending {
            message_id: message_id.clone(),
            group_id: group_id.to_string(),
            body,
            receive_count: 0,
        });
        inner.notify.notify_waiters();
        trace!(queue = %queue, group = group_id, message_id = %message_id, "Enqueued");
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &QueueRef,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, InfraError> {
        let inner = self.inner(queue)?;
        let deadline = Instant::now() + wait;

        loop {
            // Register before checking so a send between the check and the
            // wait is not missed.
            let notified = inner.notify.notified();

            if inner.closed.load(Ordering::Acquire) {
                return Err(InfraError::QueueNotFound(queue.to_string()));
            }

            let next_expiry = {
                let mut state = inner.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(queue, now, self.config.max_receive_count);
                let taken = state.take(max.max(1), self.config.visibility_timeout);
                if !taken.is_empty() {
                    return Ok(taken);
                }
                state.in_flight.values().map(|(_, d)| *d).min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, queue: &QueueRef, receipt: &str) -> Result<(), InfraError> {
        let inner = self.inner(queue)?;
        let mut state = inner.state.lock().await;
        let (pending, _) = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| InfraError::UnknownReceipt(receipt.to_string()))?;
        state.busy_groups.remove(&pending.group_id);
        drop(state);

        inner.notify.notify_waiters();
        trace!(queue = %queue, message_id = %pending.message_id, "Acknowledged");
        Ok(())
    }

    async fn nack(&self, queue: &QueueRef, receipt: &str) -> Result<(), InfraError> {
        let inner = self.inner(queue)?;
        let mut state = inner.state.lock().await;
        let (pending, _) = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| InfraError::UnknownReceipt(receipt.to_string()))?;
        trace!(queue = %queue, message_id = %pending.message_id, "Returned for redelivery");
        state.release(queue, receipt, pending, self.config.max_receive_count);
        drop(state);

        inner.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letters(&self, queue: &QueueRef) -> Result<Vec<QueueMessage>, InfraError> {
        let inner = self.inner(queue)?;
        let state = inner.state.lock().await;
        Ok(state.dead.clone())
    }

    async fn depth(&self, queue: &QueueRef) -> Result<usize, InfraError> {
        let inner = self.inner(queue)?;
        let state = inner.state.lock().await;
        Ok(state.waiting.len() + state.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::ZERO;

    async fn queue_with(config: QueueConfig) -> (MemoryQueue, QueueRef) {
        let service = MemoryQueue::new(config);
        let queue = service.create_queue("alphaChannelQueue").await.unwrap();
        (service, queue)
    }

    #[tokio::test]
    async fn test_fifo_within_group() {
        let (service, queue) = queue_with(QueueConfig::default()).await;
        for body in ["a", "b", "c"] {
            service
                .send(&queue, "alpha", Bytes::from_static(body.as_bytes()))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = service.receive(&queue, 10, NO_WAIT).await.unwrap();
            // One in flight per group.
            assert_eq!(batch.len(), 1);
            seen.push(batch[0].body.clone());
            service.ack(&queue, &batch[0].receipt).await.unwrap();
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(service.depth(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let (service, queue) = queue_with(QueueConfig::default()).await;
        service.send(&queue, "g1", Bytes::from_static(b"1")).await.unwrap();
        service.send(&queue, "g1", Bytes::from_static(b"2")).await.unwrap();
        service.send(&queue, "g2", Bytes::from_static(b"3")).await.unwrap();

        let batch = service.receive(&queue, 10, NO_WAIT).await.unwrap();
        let bodies: Vec<_> = batch.iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let config = QueueConfig {
            max_receive_count: 2,
            ..QueueConfig::default()
        };
        let (service, queue) = queue_with(config).await;
        service.send(&queue, "alpha", Bytes::from_static(b"x")).await.unwrap();
        service.send(&queue, "alpha", Bytes::from_static(b"y")).await.unwrap();

        let first = service.receive(&queue, 1, NO_WAIT).await.unwrap();
        assert_eq!(first[0].receive_count, 1);
        service.nack(&queue, &first[0].receipt).await.unwrap();

        let second = service.receive(&queue, 1, NO_WAIT).await.unwrap();
        assert_eq!(second[0].body, "x");
        assert_eq!(second[0].receive_count, 2);
        service.nack(&queue, &second[0].receipt).await.unwrap();

        let dead = service.dead_letters(&queue).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "x");

        let next = service.receive(&queue, 1, NO_WAIT).await.unwrap();
        assert_eq!(next[0].body, "y");
    }

    #[tokio::test]
    async fn test_unknown_receipt() {
        let (service, queue) = queue_with(QueueConfig::default()).await;
        assert!(matches!(
            service.ack(&queue, "nope").await,
            Err(InfraError::UnknownReceipt(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_waits_for_send() {
        let (service, queue) = queue_with(QueueConfig::default()).await;
        let service = Arc::new(service);

        let receiver = {
            let service = Arc::clone(&service);
            let queue = queue.clone();
            tokio::spawn(async move { service.receive(&queue, 1, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        service.send(&queue, "alpha", Bytes::from_static(b"late")).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_returns_message() {
        let config = QueueConfig {
            max_receive_count: 5,
            visibility_timeout: Duration::from_secs(1),
        };
        let (service, queue) = queue_with(config).await;
        service.send(&queue, "alpha", Bytes::from_static(b"x")).await.unwrap();

        let first = service.receive(&queue, 1, NO_WAIT).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(service.receive(&queue, 1, NO_WAIT).await.unwrap().is_empty());

        let again = service
            .receive(&queue, 1, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_deleted_queue() {
        let (service, queue) = queue_with(QueueConfig::default()).await;
        service.delete_queue(&queue).await.unwrap();
        service.delete_queue(&queue).await.unwrap();
        assert!(!service.queue_exists(&queue).await);
        assert!(matches!(
            service.receive(&queue, 1, NO_WAIT).await,
            Err(InfraError::QueueNotFound(_))
        ));
    }
}
