//! Broker envelopes.
//!
//! Everything a broker topic pushes to a subscriber endpoint is wrapped in one
//! of three envelopes. The envelope kind travels out-of-band in the
//! [`MESSAGE_TYPE_HEADER`] header; the body is the JSON form of the matching
//! struct.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::codec::ProtocolError;

/// Header carrying the envelope discriminator on push deliveries.
pub const MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";

/// Well-known message attribute names.
pub mod attr {
    /// Channel the message belongs to. Meta-topic filter policies match on it.
    pub const CHANNEL: &str = "channel";
    /// Numeric account identifier of the author.
    pub const ACCOUNT: &str = "account";
    /// Submission time in epoch milliseconds.
    pub const TIMESTAMP: &str = "timestamp";
    /// Set on provisioning self-check messages.
    pub const CANARY: &str = "canary";
}

/// Envelope discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    SubscriptionConfirmation,
    Notification,
    UnsubscribeConfirmation,
    /// Anything else. Kept so it can be logged.
    Unknown(String),
}

impl MessageType {
    /// Parse the header value. Never fails; unrecognised values map to
    /// [`MessageType::Unknown`].
    #[must_use]
    pub fn from_header(value: &str) -> Self {
        match value.trim() {
            "SubscriptionConfirmation" => MessageType::SubscriptionConfirmation,
            "Notification" => MessageType::Notification,
            "UnsubscribeConfirmation" => MessageType::UnsubscribeConfirmation,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    /// Header representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::SubscriptionConfirmation => "SubscriptionConfirmation",
            MessageType::Notification => "Notification",
            MessageType::UnsubscribeConfirmation => "UnsubscribeConfirmation",
            MessageType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Number,
}

/// A single typed message attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    #[serde(rename = "Type")]
    pub data_type: DataType,
    #[serde(rename = "Value")]
    pub value: String,
}

impl AttributeValue {
    /// String attribute.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: DataType::String,
            value: value.into(),
        }
    }

    /// Number attribute. Numbers travel as their decimal representation.
    #[must_use]
    pub fn number(value: u64) -> Self {
        Self {
            data_type: DataType::Number,
            value: value.to_string(),
        }
    }
}

/// Attribute map attached to a published message.
pub type MessageAttributes = BTreeMap<String, AttributeValue>;

/// Challenge sent to a new push subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionConfirmation {
    pub token: String,
    pub topic_arn: String,
    pub message: String,
    pub timestamp: u64,
}

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    pub message_id: String,
    pub topic_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
    pub timestamp: u64,
    #[serde(default)]
    pub message_attributes: MessageAttributes,
}

impl Notification {
    /// Look up a string value among the message attributes.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(|a| a.value.as_str())
    }

    /// The `channel` attribute, if present.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.attribute(attr::CHANNEL)
    }

    /// Whether this is a provisioning self-check message.
    #[must_use]
    pub fn is_canary(&self) -> bool {
        self.attribute(attr::CANARY).is_some()
    }
}

/// Sent to a push subscriber once its subscription is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnsubscribeConfirmation {
    pub token: String,
    pub topic_arn: String,
    pub message: String,
    pub timestamp: u64,
}

/// Any envelope a broker can push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum BrokerEnvelope {
    SubscriptionConfirmation(SubscriptionConfirmation),
    Notification(Notification),
    UnsubscribeConfirmation(UnsubscribeConfirmation),
}

impl BrokerEnvelope {
    /// Discriminator for the header.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            BrokerEnvelope::SubscriptionConfirmation(_) => MessageType::SubscriptionConfirmation,
            BrokerEnvelope::Notification(_) => MessageType::Notification,
            BrokerEnvelope::UnsubscribeConfirmation(_) => MessageType::UnsubscribeConfirmation,
        }
    }

    /// Topic the envelope came from.
    #[must_use]
    pub fn topic_arn(&self) -> &str {
        match self {
            BrokerEnvelope::SubscriptionConfirmation(c) => &c.topic_arn,
            BrokerEnvelope::Notification(n) => &n.topic_arn,
            BrokerEnvelope::UnsubscribeConfirmation(u) => &u.topic_arn,
        }
    }
}

/// Parse a pushed body according to its header discriminator.
///
/// The header wins over any `Type` field inside the body. Unknown
/// discriminators yield `Ok(None)` so callers can log and move on.
///
/// # Errors
///
/// Returns an error if the body does not match the announced envelope.
pub fn parse_envelope(
    message_type: &MessageType,
    body: &str,
) -> Result<Option<BrokerEnvelope>, ProtocolError> {
    let envelope = match message_type {
        MessageType::SubscriptionConfirmation => {
            BrokerEnvelope::SubscriptionConfirmation(serde_json::from_str(body)?)
        }
        MessageType::Notification => BrokerEnvelope::Notification(serde_json::from_str(body)?),
        MessageType::UnsubscribeConfirmation => {
            BrokerEnvelope::UnsubscribeConfirmation(serde_json::from_str(body)?)
        }
        MessageType::Unknown(_) => return Ok(None),
    };
    Ok(Some(envelope))
}
