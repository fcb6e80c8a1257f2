//! Channel naming and resource references.
//!
//! A channel name is the join key between the meta-topic filter policy, the
//! channel's queue, its table and its endpoint topic. Every resource name is
//! derived from it here so the convention lives in one place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum channel name length. Queue names are capped at 80 characters and
/// carry a 12 character suffix.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 64;

/// Name of the shared topic every submission passes through.
pub const META_TOPIC_NAME: &str = "metaTopic";

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    // Names end up inside queue, table and topic names.
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("Channel name may only contain ASCII letters, digits, '-' and '_'");
    }
    Ok(())
}

macro_rules! resource_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

resource_ref!(
    /// Identifier of a broker topic.
    TopicRef
);
resource_ref!(
    /// Identifier of a durable queue.
    QueueRef
);
resource_ref!(
    /// Identifier of a record store table.
    TableRef
);
resource_ref!(
    /// Identifier of a topic subscription.
    SubscriptionRef
);

/// Resource names derived from a channel name.
///
/// Resources keep the name they were created under, so a renamed channel
/// still holds the plain names of its first name. A new channel reusing that
/// name gets [`ResourceNames::qualified`] names instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub queue: String,
    pub table: String,
    pub endpoint_topic: String,
}

impl ResourceNames {
    /// Derive the names for `channel`.
    #[must_use]
    pub fn for_channel(channel: &str) -> Self {
        Self::with_base(channel)
    }

    /// Names qualified by the directory id. `.` never appears in a channel
    /// name, so these cannot collide with any plain names.
    #[must_use]
    pub fn qualified(channel: &str, id: u64) -> Self {
        Self::with_base(&format!("{channel}.{id}"))
    }

    fn with_base(base: &str) -> Self {
        Self {
            queue: format!("{base}ChannelQueue"),
            table: format!("{base}Table"),
            endpoint_topic: format!("{base}EndpointTopic"),
        }
    }

    /// Every name in the set.
    #[must_use]
    pub fn all(&self) -> [&str; 3] {
        [&self.queue, &self.table, &self.endpoint_topic]
    }
}

/// Every resource a ready channel owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRefs {
    pub queue: QueueRef,
    pub endpoint_topic: TopicRef,
    pub table: TableRef,
    /// The queue's filtered subscription to the meta topic.
    pub subscription: SubscriptionRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("Main").is_ok());
        assert!(validate_channel_name("dev-chat_2").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("has space").is_err());
        assert!(validate_channel_name("$system").is_err());
        assert!(validate_channel_name("caf\u{e9}").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_resource_names() {
        let names = ResourceNames::for_channel("alpha");
        assert_eq!(names.queue, "alphaChannelQueue");
        assert_eq!(names.table, "alphaTable");
        assert_eq!(names.endpoint_topic, "alphaEndpointTopic");

        let qualified = ResourceNames::qualified("alpha", 3);
        assert_eq!(qualified.queue, "alpha.3ChannelQueue");
        assert!(validate_channel_name("alpha.3").is_err());
    }

    #[test]
    fn test_refs_serialize_as_plain_strings() {
        let topic = TopicRef::new("arn:murmur:topic:alphaEndpointTopic");
        assert_eq!(
            serde_json::to_string(&topic).unwrap(),
            "\"arn:murmur:topic:alphaEndpointTopic\""
        );
        assert_eq!(topic.to_string(), topic.as_str());
    }
}
