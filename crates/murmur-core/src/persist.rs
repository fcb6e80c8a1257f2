//! Persistence handler and queue workers.
//!
//! One worker task per channel queue receives messages, hands them to the
//! [`PersistenceHandler`] under a timeout and acknowledges or returns them.
//! Delivery is at-least-once; the record store's keyed put makes replays
//! harmless.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use murmur_protocol::{codec, Notification, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::QueueRef;
use crate::infra::{Broker, DurableQueue, InfraError, PutOutcome, QueueMessage, RecordStore};
use crate::locator::{LookupError, ServiceLocator};
use crate::message::{Message, MessageError};

/// Counter of records written by queue workers.
pub const PERSISTED_TOTAL: &str = "murmur_messages_persisted_total";
/// Counter of failed persistence invocations, labelled by `kind`.
pub const PERSIST_FAILURES_TOTAL: &str = "murmur_persist_failures_total";

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The queue payload is not a notification.
    #[error("Undecodable payload: {0}")]
    Decode(#[from] ProtocolError),

    /// The notification lacks the routing attributes.
    #[error("Malformed notification: {0}")]
    Malformed(#[from] MessageError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("Store write failed: {0}")]
    Store(#[source] InfraError),

    #[error("Republish failed: {0}")]
    Publish(#[source] InfraError),

    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),
}

impl PersistError {
    /// Whether redelivery may succeed.
    ///
    /// Payloads that cannot be decoded never will, so they are acknowledged
    /// and dropped instead of cycling through the queue.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PersistError::Decode(_) | PersistError::Malformed(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            PersistError::Decode(_) => "decode",
            PersistError::Malformed(_) => "malformed",
            PersistError::Lookup(_) => "lookup",
            PersistError::Store(_) => "store",
            PersistError::Publish(_) => "publish",
            PersistError::Timeout(_) => "timeout",
        }
    }
}

/// What a successful invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Stored and republished.
    Stored { channel: String, put: PutOutcome },
    /// A provisioning self-check message. Nothing was written.
    Canary,
}

/// Writes a queued message to its channel's table and republishes it on the
/// channel's endpoint topic. Stateless.
#[derive(Clone)]
pub struct PersistenceHandler {
    store: Arc<dyn RecordStore>,
    broker: Arc<dyn Broker>,
    locator: Arc<ServiceLocator>,
}

impl PersistenceHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        broker: Arc<dyn Broker>,
        locator: Arc<ServiceLocator>,
    ) -> Self {
        Self {
            store,
            broker,
            locator,
        }
    }

    /// Process one queue payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded, the channel cannot
    /// be resolved, or the store or broker fails. Nothing is republished
    /// unless the record was stored.
    pub async fn handle(&self, body: &[u8]) -> Result<PersistOutcome, PersistError> {
        let notification: Notification = codec::decode(body)?;
        if notification.is_canary() {
            debug!(message_id = %notification.message_id, "Skipping canary");
            return Ok(PersistOutcome::Canary);
        }

        let message = Message::from_notification(&notification)?;
        let refs = self.locator.channel(&message.channel).map_err(|e| {
            warn!(channel = %message.channel, error = %e, "Channel lookup failed");
            e
        })?;

        let put = self
            .store
            .put(&refs.table, message.record())
            .await
            .map_err(PersistError::Store)?;
        if put == PutOutcome::Replaced {
            warn!(
                channel = %message.channel,
                account = message.account,
                timestamp = message.timestamp,
                "Overwrote a different record under the same key"
            );
        }

        self.broker
            .publish(
                &refs.endpoint_topic,
                message.content.clone(),
                message.attributes(),
            )
            .await
            .map_err(PersistError::Publish)?;

        trace!(channel = %message.channel, ?put, "Persisted");
        Ok(PersistOutcome::Stored {
            channel: message.channel,
            put,
        })
    }
}

/// Queue worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages requested per receive.
    pub receive_batch: usize,
    /// Long-poll wait per receive.
    pub receive_wait: Duration,
    /// Budget for one handler invocation.
    pub processing_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            receive_batch: 10,
            receive_wait: Duration::from_secs(1),
            processing_timeout: Duration::from_secs(5),
        }
    }
}

/// Drains one channel queue into a [`PersistenceHandler`].
pub struct QueueWorker {
    queue: QueueRef,
    queues: Arc<dyn DurableQueue>,
    handler: PersistenceHandler,
    config: WorkerConfig,
}

impl QueueWorker {
    /// Create a worker for `queue`.
    #[must_use]
    pub fn new(
        queue: QueueRef,
        queues: Arc<dyn DurableQueue>,
        handler: PersistenceHandler,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            queues,
            handler,
            config,
        }
    }

    /// Run until the queue is deleted.
    pub async fn run(self) {
        debug!(queue = %self.queue, "Queue worker started");
        loop {
            let batch = match self
                .queues
                .receive(&self.queue, self.config.receive_batch, self.config.receive_wait)
                .await
            {
                Ok(batch) => batch,
                Err(InfraError::QueueNotFound(_)) => {
                    info!(queue = %self.queue, "Queue gone, worker stopping");
                    return;
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Receive failed");
                    tokio::time::sleep(self.config.receive_wait).await;
                    continue;
                }
            };

            for message in batch {
                self.process(message).await;
            }
        }
    }

    /// Handle one message and settle it with the queue.
    pub async fn process(&self, message: QueueMessage) {
        let timeout = self.config.processing_timeout;
        let result = match tokio::time::timeout(timeout, self.handler.handle(&message.body)).await
        {
            Ok(result) => result,
            Err(_) => Err(PersistError::Timeout(timeout)),
        };

        let settle = match result {
            Ok(outcome) => {
                if matches!(outcome, PersistOutcome::Stored { .. }) {
                    counter!(PERSISTED_TOTAL).increment(1);
                }
                self.queues.ack(&self.queue, &message.receipt).await
            }
            Err(e) => {
                counter!(PERSIST_FAILURES_TOTAL, "kind" => e.kind()).increment(1);
                if e.is_retryable() {
                    warn!(
                        queue = %self.queue,
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        error = %e,
                        "Persistence failed, returning message"
                    );
                    self.queues.nack(&self.queue, &message.receipt).await
                } else {
                    error!(
                        queue = %self.queue,
                        message_id = %message.message_id,
                        error = %e,
                        "Dropping unprocessable message"
                    );
                    self.queues.ack(&self.queue, &message.receipt).await
                }
            }
        };

        if let Err(e) = settle {
            warn!(queue = %self.queue, error = %e, "Could not settle message");
        }
    }
}

/// Starts and stops queue consumers.
#[async_trait]
pub trait QueueTrigger: Send + Sync {
    /// Start consuming a queue. Attaching twice is a no-op.
    async fn attach(&self, queue: &QueueRef);

    /// Stop consuming a queue. Returns whether a consumer was running.
    async fn detach(&self, queue: &QueueRef) -> bool;
}

/// One [`QueueWorker`] task per attached queue.
pub struct WorkerPool {
    queues: Arc<dyn DurableQueue>,
    handler: PersistenceHandler,
    config: WorkerConfig,
    workers: DashMap<QueueRef, JoinHandle<()>>,
}

impl WorkerPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(
        queues: Arc<dyn DurableQueue>,
        handler: PersistenceHandler,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queues,
            handler,
            config,
            workers: DashMap::new(),
        }
    }

    /// Number of running workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[async_trait]
impl QueueTrigger for WorkerPool {
    async fn attach(&self, queue: &QueueRef) {
        self.workers.entry(queue.clone()).or_insert_with(|| {
            info!(queue = %queue, "Attaching queue worker");
            let worker = QueueWorker::new(
                queue.clone(),
                Arc::clone(&self.queues),
                self.handler.clone(),
                self.config.clone(),
            );
            tokio::spawn(worker.run())
        });
    }

    async fn detach(&self, queue: &QueueRef) -> bool {
        match self.workers.remove(queue) {
            Some((_, handle)) => {
                handle.abort();
                info!(queue = %queue, "Detached queue worker");
                true
            }
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.iter() {
            worker.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRefs, ResourceNames};
    use crate::channel::TopicRef;
    use crate::infra::{Endpoint, FilterPolicy, MemoryBroker, MemoryQueue, MemoryRecordStore, QueueConfig};
    use bytes::Bytes;
    use murmur_protocol::BrokerEnvelope;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        broker: Arc<MemoryBroker>,
        queues: Arc<MemoryQueue>,
        meta: TopicRef,
        refs: ChannelRefs,
        handler: PersistenceHandler,
        pushed: mpsc::UnboundedReceiver<BrokerEnvelope>,
    }

    async fn fixture(config: QueueConfig) -> Fixture {
        let store = Arc::new(MemoryRecordStore::new());
        let queues = Arc::new(MemoryQueue::new(config));
        let broker = Arc::new(MemoryBroker::new(queues.clone()));
        let names = ResourceNames::for_channel("alpha");

        let meta = broker.create_topic("metaTopic").await.unwrap();
        let queue = queues.create_queue(&names.queue).await.unwrap();
        let table = store.create_table(&names.table).await.unwrap();
        let endpoint_topic = broker.create_topic(&names.endpoint_topic).await.unwrap();
        let subscription = broker
            .subscribe(
                &meta,
                Endpoint::Queue(queue.clone()),
                Some(FilterPolicy::channel("alpha")),
            )
            .await
            .unwrap();

        let (tx, mut pushed) = mpsc::unbounded_channel();
        broker
            .subscribe(&endpoint_topic, Endpoint::Push(tx), None)
            .await
            .unwrap();
        let Some(BrokerEnvelope::SubscriptionConfirmation(challenge)) = pushed.recv().await else {
            panic!("Expected confirmation challenge");
        };
        broker
            .confirm_subscription(&endpoint_topic, &challenge.token)
            .await
            .unwrap();

        let refs = ChannelRefs {
            queue,
            endpoint_topic,
            table,
            subscription,
        };
        let locator = Arc::new(ServiceLocator::new(meta.clone()));
        locator.insert("alpha", refs.clone());

        let handler = PersistenceHandler::new(store.clone(), broker.clone(), locator);
        Fixture {
            store,
            broker,
            queues,
            meta,
            refs,
            handler,
            pushed,
        }
    }

    fn payload(channel: &str, account: u64, timestamp: u64, content: &str) -> Bytes {
        let message = Message::new(channel, account, timestamp, content);
        codec::encode(&Notification {
            message_id: "m-1".into(),
            topic_arn: "arn:murmur:topic:metaTopic".into(),
            subject: None,
            message: message.content.clone(),
            timestamp,
            message_attributes: message.attributes(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_handle_stores_and_republishes() {
        let mut f = fixture(QueueConfig::default()).await;

        let outcome = f.handler.handle(&payload("alpha", 1, 1000, "hi")).await.unwrap();
        assert_eq!(
            outcome,
            PersistOutcome::Stored {
                channel: "alpha".into(),
                put: PutOutcome::Inserted
            }
        );

        let records = f.store.scan(&f.refs.table).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "hi");

        match f.pushed.recv().await.unwrap() {
            BrokerEnvelope::Notification(n) => {
                assert_eq!(n.message, "hi");
                assert_eq!(n.channel(), Some("alpha"));
                assert_eq!(n.topic_arn, f.refs.endpoint_topic.as_str());
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_delivery_yields_one_record() {
        let f = fixture(QueueConfig::default()).await;
        let body = payload("alpha", 1, 1000, "hi");
        f.handler.handle(&body).await.unwrap();
        let second = f.handler.handle(&body).await.unwrap();

        assert_eq!(
            second,
            PersistOutcome::Stored {
                channel: "alpha".into(),
                put: PutOutcome::Unchanged
            }
        );
        assert_eq!(f.store.len(&f.refs.table), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_channel_has_no_side_effects() {
        let f = fixture(QueueConfig::default()).await;
        let err = f
            .handler
            .handle(&payload("bravo", 1, 1000, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Lookup(_)));
        assert!(err.is_retryable());
        assert_eq!(f.store.len(&f.refs.table), Some(0));
    }

    #[tokio::test]
    async fn test_garbage_is_not_retryable() {
        let f = fixture(QueueConfig::default()).await;
        let err = f.handler.handle(&[0xc1]).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_worker_dead_letters_unroutable_messages() {
        let f = fixture(QueueConfig {
            max_receive_count: 2,
            ..QueueConfig::default()
        })
        .await;
        f.queues
            .send(&f.refs.queue, "bravo", payload("bravo", 1, 1000, "lost"))
            .await
            .unwrap();

        let worker = QueueWorker::new(
            f.refs.queue.clone(),
            f.queues.clone(),
            f.handler.clone(),
            WorkerConfig {
                receive_wait: Duration::ZERO,
                ..WorkerConfig::default()
            },
        );
        for _ in 0..2 {
            let batch = f
                .queues
                .receive(&f.refs.queue, 1, Duration::ZERO)
                .await
                .unwrap();
            worker.process(batch.into_iter().next().unwrap()).await;
        }

        assert_eq!(f.queues.dead_letters(&f.refs.queue).await.unwrap().len(), 1);
        assert_eq!(f.queues.depth(&f.refs.queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let mut f = fixture(QueueConfig::default()).await;
        let pool = WorkerPool::new(
            f.queues.clone(),
            f.handler.clone(),
            WorkerConfig {
                receive_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );
        pool.attach(&f.refs.queue).await;
        pool.attach(&f.refs.queue).await;
        assert_eq!(pool.len(), 1);

        f.broker
            .publish(&f.meta, "hi".into(), Message::new("alpha", 1, 1000, "hi").attributes())
            .await
            .unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(2), f.pushed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(pushed, BrokerEnvelope::Notification(_)));

        assert!(pool.detach(&f.refs.queue).await);
        assert!(!pool.detach(&f.refs.queue).await);
        assert!(pool.is_empty());
    }
}
