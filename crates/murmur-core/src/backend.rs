//! Pipeline wiring.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::channel::META_TOPIC_NAME;
use crate::directory::{ChannelDirectory, MemoryDirectory};
use crate::infra::{
    Broker, DurableQueue, InfraError, MemoryBroker, MemoryQueue, MemoryRecordStore,
    MemoryRegistry, ParameterKey, ParameterRegistry, QueueConfig, RecordStore,
};
use crate::ingest::IngestHandler;
use crate::locator::{LookupError, ServiceLocator};
use crate::message::Record;
use crate::persist::{PersistenceHandler, QueueTrigger, WorkerConfig, WorkerPool};
use crate::provision::{ProvisionConfig, Provisioner};

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Infrastructure error: {0}")]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Pipeline tuning.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub worker: WorkerConfig,
    pub provision: ProvisionConfig,
}

/// The four external collaborators plus the channel directory.
#[derive(Clone)]
pub struct Infrastructure {
    pub broker: Arc<dyn Broker>,
    pub queues: Arc<dyn DurableQueue>,
    pub store: Arc<dyn RecordStore>,
    pub registry: Arc<dyn ParameterRegistry>,
    pub directory: Arc<dyn ChannelDirectory>,
}

impl Infrastructure {
    /// Everything in process memory.
    #[must_use]
    pub fn in_memory(queue: QueueConfig) -> Self {
        let queues: Arc<dyn DurableQueue> = Arc::new(MemoryQueue::new(queue));
        Self {
            broker: Arc::new(MemoryBroker::new(Arc::clone(&queues))),
            queues,
            store: Arc::new(MemoryRecordStore::new()),
            registry: Arc::new(MemoryRegistry::new()),
            directory: Arc::new(MemoryDirectory::new()),
        }
    }
}

/// A running pipeline: ingest, persistence workers and provisioning.
pub struct Backend {
    pub infra: Infrastructure,
    pub locator: Arc<ServiceLocator>,
    pub ingest: IngestHandler,
    pub provisioner: Arc<Provisioner>,
    pub workers: Arc<WorkerPool>,
}

impl Backend {
    /// Bootstrap the meta topic, load the routing table and attach a worker
    /// to every ready channel's queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta topic cannot be created or the locator
    /// cannot be loaded.
    pub async fn start(infra: Infrastructure, config: PipelineConfig) -> Result<Self, BackendError> {
        let key = ParameterKey::MetaTopic.to_string();
        if infra.registry.get(&key).await?.is_none() {
            let topic = infra.broker.create_topic(META_TOPIC_NAME).await?;
            infra.registry.put(&key, topic.as_str()).await?;
            info!(topic = %topic, "Bootstrapped meta topic");
        }

        let locator = Arc::new(ServiceLocator::load(&infra.registry, &infra.directory).await?);

        let handler = PersistenceHandler::new(
            Arc::clone(&infra.store),
            Arc::clone(&infra.broker),
            Arc::clone(&locator),
        );
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&infra.queues),
            handler,
            config.worker,
        ));
        for name in locator.channel_names() {
            let refs = locator.channel(&name)?;
            workers.attach(&refs.queue).await;
        }

        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&infra.broker),
            Arc::clone(&infra.queues),
            Arc::clone(&infra.store),
            Arc::clone(&infra.registry),
            Arc::clone(&infra.directory),
            Arc::clone(&locator),
            workers.clone(),
            config.provision,
        ));
        let ingest = IngestHandler::new(Arc::clone(&infra.broker), Arc::clone(&locator));

        Ok(Self {
            infra,
            locator,
            ingest,
            provisioner,
            workers,
        })
    }

    /// The last `limit` records of a channel, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is unknown or the store fails.
    pub async fn history(&self, channel: &str, limit: usize) -> Result<Vec<Record>, BackendError> {
        let refs = self.locator.channel(channel)?;
        let mut records = self.infra.store.scan(&refs.table).await?;
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_bootstraps_meta_topic() {
        let infra = Infrastructure::in_memory(QueueConfig::default());
        let backend = Backend::start(infra.clone(), PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(
            backend.locator.meta_topic().as_str(),
            "arn:murmur:topic:metaTopic"
        );
        assert!(infra.broker.topic_exists(backend.locator.meta_topic()).await);
        assert!(backend.workers.is_empty());
    }

    #[tokio::test]
    async fn test_restart_reattaches_workers() {
        let infra = Infrastructure::in_memory(QueueConfig::default());
        let first = Backend::start(infra.clone(), PipelineConfig::default())
            .await
            .unwrap();
        first.provisioner.create_channel("alpha").await.unwrap();
        drop(first);

        let second = Backend::start(infra, PipelineConfig::default())
            .await
            .unwrap();
        assert!(second.locator.contains("alpha"));
        assert_eq!(second.workers.len(), 1);
    }

    #[tokio::test]
    async fn test_history_keeps_latest() {
        let backend = Backend::start(
            Infrastructure::in_memory(QueueConfig::default()),
            PipelineConfig {
                worker: WorkerConfig {
                    receive_wait: Duration::from_millis(10),
                    ..WorkerConfig::default()
                },
                ..PipelineConfig::default()
            },
        )
        .await
        .unwrap();
        let record = backend.provisioner.create_channel("alpha").await.unwrap();
        let table = record.refs().unwrap().table;
        for ts in 1..=5 {
            backend
                .infra
                .store
                .put(&table, Message::new("alpha", 1, ts, format!("m{ts}")).record())
                .await
                .unwrap();
        }

        let contents: Vec<_> = backend
            .history("alpha", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
        assert!(backend.history("bravo", 3).await.is_err());
    }
}
