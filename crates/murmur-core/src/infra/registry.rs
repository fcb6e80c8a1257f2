//! Parameter registry keys and the in-memory registry.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use tracing::trace;

use super::{InfraError, ParameterRegistry};

/// Registry key of a discoverable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterKey {
    /// `metaTopicARN`
    MetaTopic,
    /// `channelTopic<Name>ARN`
    ChannelTopic(String),
    /// `channelQueue<Name>ARN`
    ChannelQueue(String),
    /// `channelTable<Name>ARN`
    ChannelTable(String),
    /// `channelSubscription<Name>ARN`
    ChannelSubscription(String),
}

impl ParameterKey {
    /// Every per-channel key for `channel`.
    #[must_use]
    pub fn channel_keys(channel: &str) -> [ParameterKey; 4] {
        [
            ParameterKey::ChannelTopic(channel.to_string()),
            ParameterKey::ChannelQueue(channel.to_string()),
            ParameterKey::ChannelTable(channel.to_string()),
            ParameterKey::ChannelSubscription(channel.to_string()),
        ]
    }

    /// The same key for another channel. `MetaTopic` is unchanged.
    #[must_use]
    pub fn for_channel(&self, channel: &str) -> ParameterKey {
        let channel = channel.to_string();
        match self {
            ParameterKey::MetaTopic => ParameterKey::MetaTopic,
            ParameterKey::ChannelTopic(_) => ParameterKey::ChannelTopic(channel),
            ParameterKey::ChannelQueue(_) => ParameterKey::ChannelQueue(channel),
            ParameterKey::ChannelTable(_) => ParameterKey::ChannelTable(channel),
            ParameterKey::ChannelSubscription(_) => ParameterKey::ChannelSubscription(channel),
        }
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKey::MetaTopic => f.write_str("metaTopicARN"),
            ParameterKey::ChannelTopic(name) => write!(f, "channelTopic{name}ARN"),
            ParameterKey::ChannelQueue(name) => write!(f, "channelQueue{name}ARN"),
            ParameterKey::ChannelTable(name) => write!(f, "channelTable{name}ARN"),
            ParameterKey::ChannelSubscription(name) => write!(f, "channelSubscription{name}ARN"),
        }
    }
}

/// Registry keeping parameters in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    params: DashMap<String, String>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[async_trait]
impl ParameterRegistry for MemoryRegistry {
    async fn put(&self, key: &str, value: &str) -> Result<(), InfraError> {
        trace!(key, value, "Put parameter");
        self.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        Ok(self.params.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), InfraError> {
        self.params.remove(key);
        Ok(())
    }
}
