//! Ingest handler.
//!
//! Validates a submission and publishes it once on the meta topic, tagged
//! with the attributes the per-channel filter policies match on.

use murmur_protocol::api::SendMessageRequest;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::infra::{Broker, InfraError};
use crate::locator::{LookupError, ServiceLocator};
use crate::message::{Message, MAX_CONTENT_LENGTH};

/// Ingest errors.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The submission is malformed.
    #[error("Invalid message: {0}")]
    Validation(String),

    /// The channel is not routable.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The broker rejected the publish.
    #[error("Publish failed: {0}")]
    Publish(#[from] InfraError),
}

/// Check a raw submission and turn it into a [`Message`].
///
/// # Errors
///
/// Returns [`IngestError::Validation`] if the channel or content is empty,
/// the content is too long, or the account or timestamp is not an unsigned
/// integer.
pub fn validate(request: &SendMessageRequest) -> Result<Message, IngestError> {
    if request.channel.trim().is_empty() {
        return Err(IngestError::Validation("channel must not be empty".into()));
    }
    if request.message.is_empty() {
        return Err(IngestError::Validation("message must not be empty".into()));
    }
    if request.message.len() > MAX_CONTENT_LENGTH {
        return Err(IngestError::Validation(format!(
            "message exceeds {MAX_CONTENT_LENGTH} bytes"
        )));
    }
    let account = request.account.as_u64().ok_or_else(|| {
        IngestError::Validation(format!("account {} is not a numeric identifier", request.account))
    })?;
    let timestamp = request.timestamp.as_u64().ok_or_else(|| {
        IngestError::Validation(format!("timestamp {} is not an integer", request.timestamp))
    })?;

    Ok(Message::new(
        request.channel.clone(),
        account,
        timestamp,
        request.message.clone(),
    ))
}

/// Publishes submissions onto the meta topic. Stateless.
#[derive(Clone)]
pub struct IngestHandler {
    broker: Arc<dyn Broker>,
    locator: Arc<ServiceLocator>,
}

impl IngestHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, locator: Arc<ServiceLocator>) -> Self {
        Self { broker, locator }
    }

    /// Validate and publish a raw submission. Returns the broker message id.
    ///
    /// # Errors
    ///
    /// See [`validate`] and [`IngestHandler::publish`].
    pub async fn submit(&self, request: &SendMessageRequest) -> Result<String, IngestError> {
        let message = validate(request)?;
        self.publish(&message).await
    }

    /// Publish an already validated message. No retries.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Lookup`] if the channel is not ready and
    /// [`IngestError::Publish`] if the broker fails.
    pub async fn publish(&self, message: &Message) -> Result<String, IngestError> {
        self.locator.channel(&message.channel)?;

        let message_id = self
            .broker
            .publish(
                self.locator.meta_topic(),
                message.content.clone(),
                message.attributes(),
            )
            .await
            .map_err(|e| {
                warn!(channel = %message.channel, error = %e, "Publish to meta topic failed");
                e
            })?;

        debug!(
            channel = %message.channel,
            account = message.account,
            message_id = %message_id,
            "Message ingested"
        );
        Ok(message_id)
    }
}
