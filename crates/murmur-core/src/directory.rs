//! Channel directory.
//!
//! The directory is the list of channels clients can see. A record is written
//! in [`ChannelStatus::Provisioning`] before any resource exists and doubles
//! as the provisioning journal: the resources created so far are saved on it
//! step by step. Only [`ChannelStatus::Ready`] records are listed.

use async_trait::async_trait;
use murmur_protocol::api::ChannelView;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::channel::{ChannelRefs, QueueRef, SubscriptionRef, TableRef, TopicRef};
use crate::message::now_millis;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Channel already exists: {0}")]
    AlreadyExists(String),

    #[error("Channel not found: {0}")]
    NotFound(String),

    #[error("Directory storage error: {0}")]
    Storage(String),
}

/// Lifecycle of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Being created or torn down. Hidden from listings.
    Provisioning,
    /// Listed, publishable and subscribable.
    Ready,
}

/// Resources created for a channel so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResources {
    pub queue: Option<QueueRef>,
    pub table: Option<TableRef>,
    pub endpoint_topic: Option<TopicRef>,
    pub subscription: Option<SubscriptionRef>,
}

impl From<ChannelRefs> for ChannelResources {
    fn from(refs: ChannelRefs) -> Self {
        Self {
            queue: Some(refs.queue),
            table: Some(refs.table),
            endpoint_topic: Some(refs.endpoint_topic),
            subscription: Some(refs.subscription),
        }
    }
}

impl ChannelResources {
    /// Whether any resource was created under `name`, matched against the
    /// last `:` segment of its reference.
    #[must_use]
    pub fn uses_name(&self, name: &str) -> bool {
        let refs = [
            self.queue.as_ref().map(|r| r.as_str()),
            self.table.as_ref().map(|r| r.as_str()),
            self.endpoint_topic.as_ref().map(|r| r.as_str()),
        ];
        refs.into_iter()
            .flatten()
            .any(|r| r.rsplit(':').next() == Some(name))
    }
}

/// One channel in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: u64,
    pub name: String,
    pub status: ChannelStatus,
    pub resources: ChannelResources,
    /// Epoch milliseconds.
    pub created_at: u64,
}

impl ChannelRecord {
    /// All four references, once every resource exists.
    #[must_use]
    pub fn refs(&self) -> Option<ChannelRefs> {
        let r = &self.resources;
        Some(ChannelRefs {
            queue: r.queue.clone()?,
            endpoint_topic: r.endpoint_topic.clone()?,
            table: r.table.clone()?,
            subscription: r.subscription.clone()?,
        })
    }

    /// Whether the channel is live.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == ChannelStatus::Ready
    }

    /// HTTP representation. Missing resources render as empty strings.
    #[must_use]
    pub fn view(&self) -> ChannelView {
        fn arn<T: ToString>(r: &Option<T>) -> String {
            r.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        ChannelView {
            id: self.id,
            name: self.name.clone(),
            endpoint_topic_arn: arn(&self.resources.endpoint_topic),
            queue_arn: arn(&self.resources.queue),
            table_arn: arn(&self.resources.table),
            subscription_arn: arn(&self.resources.subscription),
        }
    }
}

/// Channel metadata store.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Claim a name in `Provisioning` status.
    ///
    /// A name whose record is still `Provisioning` is handed back as is so an
    /// interrupted provisioning can resume.
    async fn reserve(&self, name: &str) -> Result<ChannelRecord, DirectoryError>;

    /// Record the resources created so far.
    async fn save_resources(
        &self,
        name: &str,
        resources: ChannelResources,
    ) -> Result<(), DirectoryError>;

    /// Flip a record to `Ready` with its final references.
    async fn commit(&self, name: &str, refs: ChannelRefs) -> Result<ChannelRecord, DirectoryError>;

    /// Change the status of a record.
    async fn set_status(&self, name: &str, status: ChannelStatus) -> Result<(), DirectoryError>;

    /// Fetch a record in any status.
    async fn get(&self, name: &str) -> Result<Option<ChannelRecord>, DirectoryError>;

    /// Every `Ready` record, ordered by id.
    async fn list(&self) -> Result<Vec<ChannelRecord>, DirectoryError>;

    /// Every record in any status, ordered by id.
    async fn records(&self) -> Result<Vec<ChannelRecord>, DirectoryError>;

    /// Rename a record.
    async fn rename(&self, from: &str, to: &str) -> Result<ChannelRecord, DirectoryError>;

    /// Delete a record. Returns it if it existed.
    async fn remove(&self, name: &str) -> Result<Option<ChannelRecord>, DirectoryError>;
}

/// Directory keeping records in memory.
#[derive(Default)]
pub struct MemoryDirectory {
    records: Mutex<BTreeMap<String, ChannelRecord>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelDirectory for MemoryDirectory {
    async fn reserve(&self, name: &str) -> Result<ChannelRecord, DirectoryError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(name) {
            return match existing.status {
                ChannelStatus::Ready => Err(DirectoryError::AlreadyExists(name.to_string())),
                ChannelStatus::Provisioning => {
                    debug!(channel = %name, id = existing.id, "Resuming reservation");
                    Ok(existing.clone())
                }
            };
        }

        let id = records.values().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = ChannelRecord {
            id,
            name: name.to_string(),
            status: ChannelStatus::Provisioning,
            resources: ChannelResources::default(),
            created_at: now_millis(),
        };
        records.insert(name.to_string(), record.clone());
        debug!(channel = %name, id, "Reserved channel");
        Ok(record)
    }

    async fn save_resources(
        &self,
        name: &str,
        resources: ChannelResources,
    ) -> Result<(), DirectoryError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        record.resources = resources;
        Ok(())
    }

    async fn commit(&self, name: &str, refs: ChannelRefs) -> Result<ChannelRecord, DirectoryError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        record.resources = refs.into();
        record.status = ChannelStatus::Ready;
        Ok(record.clone())
    }

    async fn set_status(&self, name: &str, status: ChannelStatus) -> Result<(), DirectoryError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<ChannelRecord>, DirectoryError> {
        Ok(self.records.lock().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ChannelRecord>, DirectoryError> {
        let records = self.records.lock().await;
        let mut ready: Vec<ChannelRecord> =
            records.values().filter(|r| r.is_ready()).cloned().collect();
        ready.sort_by_key(|r| r.id);
        Ok(ready)
    }

    async fn records(&self) -> Result<Vec<ChannelRecord>, DirectoryError> {
        let records = self.records.lock().await;
        let mut all: Vec<ChannelRecord> = records.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<ChannelRecord, DirectoryError> {
        let mut records = self.records.lock().await;
        if records.contains_key(to) {
            return Err(DirectoryError::AlreadyExists(to.to_string()));
        }
        let mut record = records
            .remove(from)
            .ok_or_else(|| DirectoryError::NotFound(from.to_string()))?;
        record.name = to.to_string();
        records.insert(to.to_string(), record.clone());
        Ok(record)
    }

    async fn remove(&self, name: &str) -> Result<Option<ChannelRecord>, DirectoryError> {
        Ok(self.records.lock().await.remove(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(channel: &str) -> ChannelRefs {
        ChannelRefs {
            queue: QueueRef::new(format!("q-{channel}")),
            endpoint_topic: TopicRef::new(format!("t-{channel}")),
            table: TableRef::new(format!("d-{channel}")),
            subscription: SubscriptionRef::new(format!("s-{channel}")),
        }
    }

    #[tokio::test]
    async fn test_reserve_then_commit() {
        let directory = MemoryDirectory::new();
        let record = directory.reserve("alpha").await.unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.status, ChannelStatus::Provisioning);
        assert!(directory.list().await.unwrap().is_empty());

        let committed = directory.commit("alpha", refs("alpha")).await.unwrap();
        assert!(committed.is_ready());
        assert_eq!(committed.refs(), Some(refs("alpha")));

        let listed = directory.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].view().queue_arn, "q-alpha");

        assert!(matches!(
            directory.reserve("alpha").await,
            Err(DirectoryError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_resumes_provisioning_record() {
        let directory = MemoryDirectory::new();
        let first = directory.reserve("alpha").await.unwrap();
        directory
            .save_resources(
                "alpha",
                ChannelResources {
                    queue: Some(QueueRef::new("q-alpha")),
                    ..ChannelResources::default()
                },
            )
            .await
            .unwrap();

        let again = directory.reserve("alpha").await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.resources.queue, Some(QueueRef::new("q-alpha")));
        assert_eq!(again.refs(), None);
    }

    #[test]
    fn test_resources_match_by_name() {
        let resources = ChannelResources {
            queue: Some(QueueRef::new("arn:murmur:queue:alphaChannelQueue")),
            table: Some(TableRef::new("arn:murmur:table:alphaTable")),
            ..ChannelResources::default()
        };
        assert!(resources.uses_name("alphaChannelQueue"));
        assert!(resources.uses_name("alphaTable"));
        assert!(!resources.uses_name("alphaEndpointTopic"));
        assert!(!resources.uses_name("ChannelQueue"));
    }

    #[tokio::test]
    async fn test_records_include_provisioning() {
        let directory = MemoryDirectory::new();
        directory.reserve("alpha").await.unwrap();
        directory.reserve("bravo").await.unwrap();
        directory.commit("bravo", refs("bravo")).await.unwrap();

        assert_eq!(directory.list().await.unwrap().len(), 1);
        let names: Vec<_> = directory
            .records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "bravo"]);
    }

    #[tokio::test]
    async fn test_ids_are_max_plus_one() {
        let directory = MemoryDirectory::new();
        for name in ["a", "b", "c"] {
            directory.reserve(name).await.unwrap();
        }
        directory.remove("b").await.unwrap();
        directory.remove("c").await.unwrap();
        assert_eq!(directory.reserve("d").await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_rename() {
        let directory = MemoryDirectory::new();
        for name in ["alpha", "bravo"] {
            directory.reserve(name).await.unwrap();
            directory.commit(name, refs(name)).await.unwrap();
        }

        assert!(matches!(
            directory.rename("alpha", "bravo").await,
            Err(DirectoryError::AlreadyExists(_))
        ));
        assert!(matches!(
            directory.rename("zulu", "omega").await,
            Err(DirectoryError::NotFound(_))
        ));

        let renamed = directory.rename("alpha", "omega").await.unwrap();
        assert_eq!(renamed.id, 1);
        assert!(directory.get("alpha").await.unwrap().is_none());
        let names: Vec<_> = directory
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["omega", "bravo"]);
    }
}
