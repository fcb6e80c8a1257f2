//! Service discovery.
//!
//! Components locate each other's resources through the parameter registry.
//! The [`ServiceLocator`] resolves those parameters once at startup into a
//! routing table of channel name → [`ChannelRefs`] and is kept current by the
//! provisioner afterwards.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ChannelRefs, QueueRef, SubscriptionRef, TableRef, TopicRef};
use crate::directory::{ChannelDirectory, DirectoryError};
use crate::infra::{InfraError, ParameterKey, ParameterRegistry};

/// Lookup errors.
#[derive(Debug, Error)]
pub enum LookupError {
    /// A required registry parameter is absent.
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// No ready channel with this name.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Registry error: {0}")]
    Registry(#[from] InfraError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Resolved resource references, by channel.
#[derive(Debug)]
pub struct ServiceLocator {
    meta_topic: TopicRef,
    routes: DashMap<String, ChannelRefs>,
}

impl ServiceLocator {
    /// Create a locator with an empty routing table.
    #[must_use]
    pub fn new(meta_topic: TopicRef) -> Self {
        Self {
            meta_topic,
            routes: DashMap::new(),
        }
    }

    /// Resolve the meta topic and every ready channel.
    ///
    /// Channels whose parameters are incomplete are skipped with a warning;
    /// they stay unroutable until provisioning is re-run for them.
    ///
    /// # Errors
    ///
    /// Returns an error if the meta topic parameter is missing or a backing
    /// service fails.
    pub async fn load(
        registry: &Arc<dyn ParameterRegistry>,
        directory: &Arc<dyn ChannelDirectory>,
    ) -> Result<Self, LookupError> {
        let key = ParameterKey::MetaTopic.to_string();
        let meta_topic = registry
            .get(&key)
            .await?
            .map(TopicRef::new)
            .ok_or(LookupError::MissingParameter(key))?;

        let locator = Self::new(meta_topic);
        for record in directory.list().await? {
            match resolve_channel(registry.as_ref(), &record.name).await {
                Ok(refs) => locator.insert(&record.name, refs),
                Err(e) => warn!(channel = %record.name, error = %e, "Skipping channel"),
            }
        }

        info!(
            meta_topic = %locator.meta_topic,
            channels = locator.routes.len(),
            "Service locator loaded"
        );
        Ok(locator)
    }

    /// The shared submission topic.
    #[must_use]
    pub fn meta_topic(&self) -> &TopicRef {
        &self.meta_topic
    }

    /// References of a ready channel.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownChannel`] if the channel is not routable.
    pub fn channel(&self, name: &str) -> Result<ChannelRefs, LookupError> {
        self.routes
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| LookupError::UnknownChannel(name.to_string()))
    }

    /// Whether the channel is routable.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Make a channel routable.
    pub fn insert(&self, name: &str, refs: ChannelRefs) {
        debug!(channel = %name, "Route added");
        self.routes.insert(name.to_string(), refs);
    }

    /// Stop routing a channel.
    pub fn remove(&self, name: &str) -> Option<ChannelRefs> {
        debug!(channel = %name, "Route removed");
        self.routes.remove(name).map(|(_, refs)| refs)
    }

    /// Move a route to a new name.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownChannel`] if `from` is not routable.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), LookupError> {
        let (_, refs) = self
            .routes
            .remove(from)
            .ok_or_else(|| LookupError::UnknownChannel(from.to_string()))?;
        self.routes.insert(to.to_string(), refs);
        debug!(from = %from, to = %to, "Route renamed");
        Ok(())
    }

    /// Names of every routable channel, sorted.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}

async fn required(registry: &dyn ParameterRegistry, key: ParameterKey) -> Result<String, LookupError> {
    let key = key.to_string();
    registry
        .get(&key)
        .await?
        .ok_or(LookupError::MissingParameter(key))
}

/// Resolve a channel's references from the registry.
///
/// # Errors
///
/// Returns [`LookupError::MissingParameter`] if any of the four parameters is
/// absent.
pub async fn resolve_channel(
    registry: &dyn ParameterRegistry,
    channel: &str,
) -> Result<ChannelRefs, LookupError> {
    let name = channel.to_string();
    Ok(ChannelRefs {
        queue: QueueRef::new(required(registry, ParameterKey::ChannelQueue(name.clone())).await?),
        endpoint_topic: TopicRef::new(
            required(registry, ParameterKey::ChannelTopic(name.clone())).await?,
        ),
        table: TableRef::new(required(registry, ParameterKey::ChannelTable(name.clone())).await?),
        subscription: SubscriptionRef::new(
            required(registry, ParameterKey::ChannelSubscription(name)).await?,
        ),
    })
}
