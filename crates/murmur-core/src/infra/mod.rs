//! External collaborators.
//!
//! The pipeline talks to four pieces of infrastructure through the traits in
//! this module: a record store, a broker with filterable topics, a durable
//! queue and a parameter registry. Each has an in-process implementation
//! used by the gateway binary and by tests.

use async_trait::async_trait;
use bytes::Bytes;
use murmur_protocol::{BrokerEnvelope, MessageAttributes, ProtocolError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{QueueRef, SubscriptionRef, TableRef, TopicRef};
use crate::message::Record;

pub mod broker;
pub mod queue;
pub mod registry;
pub mod store;

pub use broker::{FilterPolicy, MemoryBroker};
pub use queue::{MemoryQueue, QueueConfig};
pub use registry::{MemoryRegistry, ParameterKey};
pub use store::MemoryRecordStore;

/// Infrastructure errors.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid confirmation token for topic {0}")]
    InvalidToken(String),

    #[error("Unknown receipt: {0}")]
    UnknownReceipt(String),

    /// The service could not be reached. Retryable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outcome of a keyed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No record existed under the key.
    Inserted,
    /// An identical record was already stored.
    Unchanged,
    /// A different record under the same key was overwritten.
    Replaced,
}

/// Durable keyed storage, one table per channel.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a table. Creating an existing table returns its reference.
    async fn create_table(&self, name: &str) -> Result<TableRef, InfraError>;

    /// Delete a table. Deleting a missing table is not an error.
    async fn delete_table(&self, table: &TableRef) -> Result<(), InfraError>;

    /// Whether the table exists.
    async fn table_exists(&self, table: &TableRef) -> bool;

    /// Store a record under its `(account, timestamp)` key.
    async fn put(&self, table: &TableRef, record: Record) -> Result<PutOutcome, InfraError>;

    /// Fetch one record.
    async fn get(
        &self,
        table: &TableRef,
        account: u64,
        timestamp: u64,
    ) -> Result<Option<Record>, InfraError>;

    /// All records of a table, ordered by timestamp.
    async fn scan(&self, table: &TableRef) -> Result<Vec<Record>, InfraError>;
}

/// Receiving side of a push subscription.
pub type PushSink = mpsc::UnboundedSender<BrokerEnvelope>;

/// Where a topic subscription delivers.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Enqueue every matching notification. Confirmed on creation.
    Queue(QueueRef),
    /// Push envelopes to a listener. Must answer the confirmation challenge
    /// before notifications flow.
    Push(PushSink),
}

impl Endpoint {
    /// Short protocol name for logs.
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        match self {
            Endpoint::Queue(_) => "queue",
            Endpoint::Push(_) => "push",
        }
    }
}

/// Publish/subscribe bus with attribute filter policies.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a topic. Creating an existing topic returns its reference.
    async fn create_topic(&self, name: &str) -> Result<TopicRef, InfraError>;

    /// Delete a topic and all of its subscriptions. Missing topics are ignored.
    async fn delete_topic(&self, topic: &TopicRef) -> Result<(), InfraError>;

    /// Whether the topic exists.
    async fn topic_exists(&self, topic: &TopicRef) -> bool;

    /// Subscribe an endpoint. Subscribing the same queue twice updates the
    /// filter policy of the existing subscription.
    async fn subscribe(
        &self,
        topic: &TopicRef,
        endpoint: Endpoint,
        filter: Option<FilterPolicy>,
    ) -> Result<SubscriptionRef, InfraError>;

    /// Answer a confirmation challenge.
    async fn confirm_subscription(
        &self,
        topic: &TopicRef,
        token: &str,
    ) -> Result<SubscriptionRef, InfraError>;

    /// Remove a subscription.
    async fn unsubscribe(&self, subscription: &SubscriptionRef) -> Result<(), InfraError>;

    /// Replace the filter policy of a subscription.
    async fn set_filter_policy(
        &self,
        subscription: &SubscriptionRef,
        filter: FilterPolicy,
    ) -> Result<(), InfraError>;

    /// Current filter policy of a subscription.
    async fn filter_policy(
        &self,
        subscription: &SubscriptionRef,
    ) -> Result<Option<FilterPolicy>, InfraError>;

    /// Publish a message. Returns the broker-assigned message id.
    async fn publish(
        &self,
        topic: &TopicRef,
        message: String,
        attributes: MessageAttributes,
    ) -> Result<String, InfraError>;
}

/// A message handed out by [`DurableQueue::receive`].
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Handle for [`DurableQueue::ack`] / [`DurableQueue::nack`].
    pub receipt: String,
    pub message_id: String,
    /// FIFO group.
    pub group_id: String,
    pub body: Bytes,
    /// How many times this message has been handed out, including this one.
    pub receive_count: u32,
}

/// At-least-once queue, FIFO within a message group.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Create a queue. Creating an existing queue returns its reference.
    async fn create_queue(&self, name: &str) -> Result<QueueRef, InfraError>;

    /// Delete a queue and everything in it. Missing queues are ignored.
    async fn delete_queue(&self, queue: &QueueRef) -> Result<(), InfraError>;

    /// Whether the queue exists.
    async fn queue_exists(&self, queue: &QueueRef) -> bool;

    /// Enqueue a message. Returns its id.
    async fn send(&self, queue: &QueueRef, group_id: &str, body: Bytes)
        -> Result<String, InfraError>;

    /// Receive up to `max` messages, waiting up to `wait` for the first one.
    ///
    /// While a message is in flight no other message of its group is handed
    /// out.
    async fn receive(
        &self,
        queue: &QueueRef,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, InfraError>;

    /// Delete a received message.
    async fn ack(&self, queue: &QueueRef, receipt: &str) -> Result<(), InfraError>;

    /// Return a received message for redelivery.
    async fn nack(&self, queue: &QueueRef, receipt: &str) -> Result<(), InfraError>;

    /// Messages that exhausted their receive budget.
    async fn dead_letters(&self, queue: &QueueRef) -> Result<Vec<QueueMessage>, InfraError>;

    /// Messages waiting or in flight.
    async fn depth(&self, queue: &QueueRef) -> Result<usize, InfraError>;
}

/// Name → value lookup used for service discovery.
#[async_trait]
pub trait ParameterRegistry: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), InfraError>;
    async fn get(&self, key: &str) -> Result<Option<String>, InfraError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), InfraError>;
}
