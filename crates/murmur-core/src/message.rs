//! Message and record types.

use murmur_protocol::{attr, AttributeValue, MessageAttributes, Notification};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Largest accepted message content in bytes.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a process-unique identifier with the given prefix.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{timestamp:x}-{counter:x}")
}

/// Errors turning broker attributes back into a [`Message`].
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Missing message attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid value {value:?} for message attribute {name}")]
    InvalidAttribute { name: &'static str, value: String },
}

/// A chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub account: u64,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub content: String,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        account: u64,
        timestamp: u64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            account,
            timestamp,
            content: content.into(),
        }
    }

    /// Filterable attributes carried next to the content on every topic.
    #[must_use]
    pub fn attributes(&self) -> MessageAttributes {
        let mut attributes = MessageAttributes::new();
        attributes.insert(attr::CHANNEL.into(), AttributeValue::string(&self.channel));
        attributes.insert(attr::ACCOUNT.into(), AttributeValue::number(self.account));
        attributes.insert(
            attr::TIMESTAMP.into(),
            AttributeValue::number(self.timestamp),
        );
        attributes
    }

    /// Rebuild a message from a topic notification.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute is missing or not numeric where it
    /// should be.
    pub fn from_notification(notification: &Notification) -> Result<Self, MessageError> {
        let channel = notification
            .channel()
            .ok_or(MessageError::MissingAttribute(attr::CHANNEL))?;
        let account = numeric_attribute(notification, attr::ACCOUNT)?;
        let timestamp = numeric_attribute(notification, attr::TIMESTAMP)?;

        Ok(Self::new(
            channel,
            account,
            timestamp,
            notification.message.clone(),
        ))
    }

    /// The stored form of this message.
    #[must_use]
    pub fn record(&self) -> Record {
        Record {
            account: self.account,
            timestamp: self.timestamp,
            content: self.content.clone(),
        }
    }
}

fn numeric_attribute(notification: &Notification, name: &'static str) -> Result<u64, MessageError> {
    let value = notification
        .attribute(name)
        .ok_or(MessageError::MissingAttribute(name))?;
    value.parse().map_err(|_| MessageError::InvalidAttribute {
        name,
        value: value.to_string(),
    })
}

/// Natural key of a stored record. Writing the same key twice overwrites.
pub type RecordKey = (u64, u64);

/// A message as kept in a channel's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub account: u64,
    pub timestamp: u64,
    pub content: String,
}

impl Record {
    /// `(account, timestamp)`.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        (self.account, self.timestamp)
    }
}
