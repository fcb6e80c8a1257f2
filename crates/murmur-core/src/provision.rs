//! Channel provisioning.
//!
//! Creating a channel touches five services. The directory record is claimed
//! first in `Provisioning` status and records every resource as it is
//! created, so an interrupted run can be resumed by provisioning the same
//! name again. Every step is idempotent by name. If a step fails, the steps
//! completed so far are undone in reverse order and the claim is released.
//!
//! The flip to `Ready` together with the locator insert is the commit point:
//! before it the channel is neither listed nor publishable.

use murmur_protocol::{attr, codec, AttributeValue, Notification};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{validate_channel_name, ChannelRefs, QueueRef, ResourceNames};
use crate::directory::{
    ChannelDirectory, ChannelRecord, ChannelResources, ChannelStatus, DirectoryError,
};
use crate::infra::{
    Broker, DurableQueue, Endpoint, FilterPolicy, ParameterKey, ParameterRegistry, RecordStore,
};
use crate::locator::ServiceLocator;
use crate::message::Message;
use crate::persist::QueueTrigger;

type BoxError = Box<dyn StdError + Send + Sync>;

/// A unit of provisioning or teardown work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    Reserve,
    Queue,
    Table,
    EndpointTopic,
    FilterSubscription,
    FilterCheck,
    AttachConsumer,
    Registry,
    Commit,
}

impl ProvisionStep {
    fn as_str(self) -> &'static str {
        match self {
            ProvisionStep::Reserve => "reserve",
            ProvisionStep::Queue => "queue",
            ProvisionStep::Table => "table",
            ProvisionStep::EndpointTopic => "endpoint_topic",
            ProvisionStep::FilterSubscription => "filter_subscription",
            ProvisionStep::FilterCheck => "filter_check",
            ProvisionStep::AttachConsumer => "attach_consumer",
            ProvisionStep::Registry => "registry",
            ProvisionStep::Commit => "commit",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid channel name: {0}")]
    InvalidName(&'static str),

    #[error("Channel already exists: {0}")]
    AlreadyExists(String),

    #[error("Channel not found: {0}")]
    NotFound(String),

    /// A step failed. Completed steps have been compensated.
    #[error("Provisioning step {step} failed: {source}")]
    Step {
        step: ProvisionStep,
        #[source]
        source: BoxError,
    },
}

impl ProvisionError {
    fn step(step: ProvisionStep, source: impl Into<BoxError>) -> Self {
        ProvisionError::Step {
            step,
            source: source.into(),
        }
    }
}

impl From<DirectoryError> for ProvisionError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::AlreadyExists(name) => ProvisionError::AlreadyExists(name),
            DirectoryError::NotFound(name) => ProvisionError::NotFound(name),
            other => ProvisionError::step(ProvisionStep::Reserve, other),
        }
    }
}

/// Why the filter self-check failed.
#[derive(Debug, Error)]
pub enum FilterCheckError {
    #[error("Broker reports filter policy {actual:?}, expected {expected:?}")]
    PolicyMismatch {
        expected: FilterPolicy,
        actual: Option<FilterPolicy>,
    },

    #[error("Canary did not reach the channel queue within {0:?}")]
    CanaryMissing(Duration),
}

/// Provisioning tuning.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// How long the self-check waits for its canary.
    pub canary_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            canary_timeout: Duration::from_secs(2),
        }
    }
}

/// Creates, renames and deletes channels.
pub struct Provisioner {
    broker: Arc<dyn Broker>,
    queues: Arc<dyn DurableQueue>,
    store: Arc<dyn RecordStore>,
    registry: Arc<dyn ParameterRegistry>,
    directory: Arc<dyn ChannelDirectory>,
    locator: Arc<ServiceLocator>,
    trigger: Arc<dyn QueueTrigger>,
    config: ProvisionConfig,
}

/// Provisioning progress for one channel.
struct Journal<'a> {
    name: &'a str,
    id: u64,
    resources: ChannelResources,
    done: Vec<ProvisionStep>,
}

impl<'a> Journal<'a> {
    fn resume(name: &'a str, id: u64, resources: ChannelResources) -> Self {
        let mut done = vec![ProvisionStep::Reserve];
        if resources.queue.is_some() {
            done.push(ProvisionStep::Queue);
        }
        if resources.table.is_some() {
            done.push(ProvisionStep::Table);
        }
        if resources.endpoint_topic.is_some() {
            done.push(ProvisionStep::EndpointTopic);
        }
        if resources.subscription.is_some() {
            done.push(ProvisionStep::FilterSubscription);
        }
        Self {
            name,
            id,
            resources,
            done,
        }
    }

    fn complete(&mut self, step: ProvisionStep) {
        if !self.done.contains(&step) {
            self.done.push(step);
        }
    }
}

impl Provisioner {
    /// Create a provisioner.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: Arc<dyn DurableQueue>,
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn ParameterRegistry>,
        directory: Arc<dyn ChannelDirectory>,
        locator: Arc<ServiceLocator>,
        trigger: Arc<dyn QueueTrigger>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            broker,
            queues,
            store,
            registry,
            directory,
            locator,
            trigger,
            config,
        }
    }

    /// The directory this provisioner maintains.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn ChannelDirectory> {
        &self.directory
    }

    /// Create a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidName`], [`ProvisionError::AlreadyExists`]
    /// if a ready channel has the name, or [`ProvisionError::Step`] after
    /// compensating a failed step.
    pub async fn create_channel(&self, name: &str) -> Result<ChannelRecord, ProvisionError> {
        validate_channel_name(name).map_err(ProvisionError::InvalidName)?;

        let record = self.directory.reserve(name).await?;
        info!(channel = %name, id = record.id, "Provisioning channel");

        let mut journal = Journal::resume(name, record.id, record.resources);
        match self.run(&mut journal).await {
            Ok(record) => {
                info!(channel = %name, id = record.id, "Channel ready");
                Ok(record)
            }
            Err(e) => {
                warn!(channel = %name, error = %e, "Provisioning failed, compensating");
                self.compensate(&journal).await;
                Err(e)
            }
        }
    }

    /// Return the ready channel `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// See [`Provisioner::create_channel`].
    pub async fn ensure_channel(&self, name: &str) -> Result<ChannelRecord, ProvisionError> {
        if let Some(record) = self.directory.get(name).await? {
            if record.is_ready() {
                return Ok(record);
            }
        }
        self.create_channel(name).await
    }

    async fn run(&self, journal: &mut Journal<'_>) -> Result<ChannelRecord, ProvisionError> {
        let name = journal.name;
        let names = self.resource_names(journal).await?;

        let queue = self
            .queues
            .create_queue(&names.queue)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Queue, e))?;
        journal.resources.queue = Some(queue.clone());
        journal.complete(ProvisionStep::Queue);
        self.checkpoint(journal, ProvisionStep::Queue).await?;

        let table = self
            .store
            .create_table(&names.table)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Table, e))?;
        journal.resources.table = Some(table.clone());
        journal.complete(ProvisionStep::Table);
        self.checkpoint(journal, ProvisionStep::Table).await?;

        let endpoint_topic = self
            .broker
            .create_topic(&names.endpoint_topic)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::EndpointTopic, e))?;
        journal.resources.endpoint_topic = Some(endpoint_topic.clone());
        journal.complete(ProvisionStep::EndpointTopic);
        self.checkpoint(journal, ProvisionStep::EndpointTopic).await?;

        let policy = FilterPolicy::channel(name);
        let subscription = self
            .broker
            .subscribe(
                self.locator.meta_topic(),
                Endpoint::Queue(queue.clone()),
                Some(policy.clone()),
            )
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::FilterSubscription, e))?;
        journal.resources.subscription = Some(subscription.clone());
        journal.complete(ProvisionStep::FilterSubscription);
        self.checkpoint(journal, ProvisionStep::FilterSubscription).await?;

        let refs = ChannelRefs {
            queue,
            endpoint_topic,
            table,
            subscription,
        };

        self.check_filter(name, &refs, &policy)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::FilterCheck, e))?;
        journal.complete(ProvisionStep::FilterCheck);

        self.trigger.attach(&refs.queue).await;
        journal.complete(ProvisionStep::AttachConsumer);

        self.register(name, &refs)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Registry, e))?;
        journal.complete(ProvisionStep::Registry);

        let record = self
            .directory
            .commit(name, refs.clone())
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Commit, e))?;
        self.locator.insert(name, refs);
        Ok(record)
    }

    /// Plain names unless another record already holds one of them, which
    /// happens when a renamed channel's old name is created again.
    async fn resource_names(
        &self,
        journal: &Journal<'_>,
    ) -> Result<ResourceNames, ProvisionError> {
        let plain = ResourceNames::for_channel(journal.name);
        let records = self
            .directory
            .records()
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Reserve, e))?;
        let taken = records
            .iter()
            .filter(|r| r.id != journal.id)
            .find(|r| plain.all().iter().any(|n| r.resources.uses_name(n)));
        match taken {
            Some(owner) => {
                debug!(
                    channel = %journal.name,
                    owner = %owner.name,
                    "Plain resource names taken, qualifying by id"
                );
                Ok(ResourceNames::qualified(journal.name, journal.id))
            }
            None => Ok(plain),
        }
    }

    async fn checkpoint(
        &self,
        journal: &Journal<'_>,
        step: ProvisionStep,
    ) -> Result<(), ProvisionError> {
        self.directory
            .save_resources(journal.name, journal.resources.clone())
            .await
            .map_err(|e| ProvisionError::step(step, e))
    }

    /// Verify the meta-topic filter delivers the channel's messages to its
    /// queue.
    async fn check_filter(
        &self,
        name: &str,
        refs: &ChannelRefs,
        expected: &FilterPolicy,
    ) -> Result<(), BoxError> {
        let actual = self.broker.filter_policy(&refs.subscription).await?;
        if actual.as_ref() != Some(expected) {
            return Err(FilterCheckError::PolicyMismatch {
                expected: expected.clone(),
                actual,
            }
            .into());
        }

        let mut attributes = Message::new(name, 0, 0, "").attributes();
        attributes.insert(attr::CANARY.into(), AttributeValue::string("true"));
        self.broker
            .publish(self.locator.meta_topic(), "canary".into(), attributes)
            .await?;

        let timeout = self.config.canary_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Err(FilterCheckError::CanaryMissing(timeout).into());
            }
            for received in self.queues.receive(&refs.queue, 10, wait).await? {
                let canary = codec::decode::<Notification>(&received.body)
                    .ok()
                    .filter(|n| n.is_canary() && n.channel() == Some(name));
                if canary.is_some() {
                    self.queues.ack(&refs.queue, &received.receipt).await?;
                    debug!(channel = %name, "Filter self-check passed");
                    return Ok(());
                }
                self.queues.nack(&refs.queue, &received.receipt).await?;
            }
        }
    }

    async fn register(&self, name: &str, refs: &ChannelRefs) -> Result<(), BoxError> {
        let name = name.to_string();
        let entries = [
            (ParameterKey::ChannelTopic(name.clone()), refs.endpoint_topic.as_str()),
            (ParameterKey::ChannelQueue(name.clone()), refs.queue.as_str()),
            (ParameterKey::ChannelTable(name.clone()), refs.table.as_str()),
            (ParameterKey::ChannelSubscription(name), refs.subscription.as_str()),
        ];
        for (key, value) in entries {
            self.registry.put(&key.to_string(), value).await?;
        }
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<(), BoxError> {
        for key in ParameterKey::channel_keys(name) {
            self.registry.delete(&key.to_string()).await?;
        }
        Ok(())
    }

    /// Undo completed steps in reverse order. Best effort.
    async fn compensate(&self, journal: &Journal<'_>) {
        let name = journal.name;
        let resources = &journal.resources;

        for step in journal.done.iter().rev() {
            let result: Result<(), BoxError> = match step {
                ProvisionStep::Registry => self.unregister(name).await,
                ProvisionStep::AttachConsumer => {
                    if let Some(queue) = &resources.queue {
                        self.trigger.detach(queue).await;
                    }
                    Ok(())
                }
                ProvisionStep::FilterSubscription => match &resources.subscription {
                    Some(sub) => self.broker.unsubscribe(sub).await.map_err(Into::into),
                    None => Ok(()),
                },
                ProvisionStep::EndpointTopic => match &resources.endpoint_topic {
                    Some(topic) => self.broker.delete_topic(topic).await.map_err(Into::into),
                    None => Ok(()),
                },
                ProvisionStep::Table => match &resources.table {
                    Some(table) => self.store.delete_table(table).await.map_err(Into::into),
                    None => Ok(()),
                },
                ProvisionStep::Queue => match &resources.queue {
                    Some(queue) => self.queues.delete_queue(queue).await.map_err(Into::into),
                    None => Ok(()),
                },
                ProvisionStep::Reserve => {
                    self.directory.remove(name).await.map(|_| ()).map_err(Into::into)
                }
                ProvisionStep::FilterCheck | ProvisionStep::Commit => Ok(()),
            };
            match result {
                Ok(()) => debug!(channel = %name, %step, "Compensated"),
                Err(e) => warn!(channel = %name, %step, error = %e, "Compensation failed"),
            }
        }
    }

    /// Rename a ready channel.
    ///
    /// Resource names keep the old channel name; only the routing key moves.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] if `from` is not a ready channel,
    /// [`ProvisionError::AlreadyExists`] if `to` is taken, or
    /// [`ProvisionError::Step`] if a service fails.
    pub async fn rename_channel(&self, from: &str, to: &str) -> Result<ChannelRecord, ProvisionError> {
        validate_channel_name(to).map_err(ProvisionError::InvalidName)?;

        let record = self
            .directory
            .get(from)
            .await?
            .filter(ChannelRecord::is_ready)
            .ok_or_else(|| ProvisionError::NotFound(from.to_string()))?;
        if self.directory.get(to).await?.is_some() {
            return Err(ProvisionError::AlreadyExists(to.to_string()));
        }
        let refs = record
            .refs()
            .ok_or_else(|| ProvisionError::NotFound(from.to_string()))?;

        self.broker
            .set_filter_policy(&refs.subscription, FilterPolicy::channel(to))
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::FilterSubscription, e))?;

        let moved = async {
            self.register(to, &refs).await?;
            self.unregister(from).await?;
            Ok::<_, BoxError>(())
        }
        .await;
        if let Err(e) = moved {
            self.revert_filter(from, &refs).await;
            return Err(ProvisionError::step(ProvisionStep::Registry, e));
        }

        let renamed = match self.directory.rename(from, to).await {
            Ok(renamed) => renamed,
            Err(e) => {
                self.revert_filter(from, &refs).await;
                if let Err(e) = self.register(from, &refs).await {
                    warn!(channel = %from, error = %e, "Could not restore parameters");
                }
                return Err(ProvisionError::step(ProvisionStep::Commit, e));
            }
        };

        if self.locator.rename(from, to).is_err() {
            self.locator.insert(to, refs);
        }
        info!(from = %from, to = %to, "Channel renamed");
        Ok(renamed)
    }

    async fn revert_filter(&self, name: &str, refs: &ChannelRefs) {
        if let Err(e) = self
            .broker
            .set_filter_policy(&refs.subscription, FilterPolicy::channel(name))
            .await
        {
            warn!(channel = %name, error = %e, "Could not restore filter policy");
        }
    }

    /// Tear a channel down.
    ///
    /// The record is hidden first and removed last, so a failed teardown can
    /// be re-run.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotFound`] if there is no record, or
    /// [`ProvisionError::Step`] naming the resource that could not be
    /// removed.
    pub async fn delete_channel(&self, name: &str) -> Result<ChannelRecord, ProvisionError> {
        let record = self
            .directory
            .get(name)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(name.to_string()))?;
        info!(channel = %name, id = record.id, "Deleting channel");

        self.directory
            .set_status(name, ChannelStatus::Provisioning)
            .await?;
        self.locator.remove(name);

        let resources = &record.resources;
        if let Some(queue) = &resources.queue {
            self.trigger.detach(queue).await;
        }
        if let Some(sub) = &resources.subscription {
            self.broker
                .unsubscribe(sub)
                .await
                .map_err(|e| ProvisionError::step(ProvisionStep::FilterSubscription, e))?;
        }
        if let Some(topic) = &resources.endpoint_topic {
            self.broker
                .delete_topic(topic)
                .await
                .map_err(|e| ProvisionError::step(ProvisionStep::EndpointTopic, e))?;
        }
        if let Some(queue) = &resources.queue {
            self.drop_queue(queue).await?;
        }
        if let Some(table) = &resources.table {
            self.store
                .delete_table(table)
                .await
                .map_err(|e| ProvisionError::step(ProvisionStep::Table, e))?;
        }
        self.unregister(name)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Registry, e))?;
        self.directory.remove(name).await?;

        info!(channel = %name, "Channel deleted");
        Ok(record)
    }

    async fn drop_queue(&self, queue: &QueueRef) -> Result<(), ProvisionError> {
        if let Ok(depth) = self.queues.depth(queue).await {
            if depth > 0 {
                warn!(queue = %queue, depth, "Deleting queue with undelivered messages");
            }
        }
        self.queues
            .delete_queue(queue)
            .await
            .map_err(|e| ProvisionError::step(ProvisionStep::Queue, e))
    }
}
