//! Endpoint topic subscriptions.
//!
//! The gateway subscribes to every channel's endpoint topic as a push
//! endpoint. A subscription only forwards notifications once its
//! confirmation challenge has been answered:
//!
//! ```text
//! Unconfirmed ──challenge acked──▶ Confirmed ──unsubscribe notice──▶ Unsubscribed
//!      │
//!      └──ack or subscribe failed──▶ Failed
//! ```

use murmur_core::{SubscriptionRef, TopicRef};
use murmur_protocol::{BrokerEnvelope, Notification};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Handshake state of one endpoint topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    Unconfirmed,
    Confirmed,
    Failed,
    Unsubscribed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::Unconfirmed => "unconfirmed",
            HandshakeState::Confirmed => "confirmed",
            HandshakeState::Failed => "failed",
            HandshakeState::Unsubscribed => "unsubscribed",
        };
        f.write_str(s)
    }
}

/// What the gateway should do with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberAction {
    /// Answer the challenge.
    Confirm { topic: TopicRef, token: String },
    /// Hand the notification to the dispatcher.
    Dispatch(Notification),
    /// Nothing to do.
    Ignore,
}

#[derive(Debug, Clone)]
struct TopicSubscription {
    channel: String,
    state: HandshakeState,
    subscription: Option<SubscriptionRef>,
}

/// Per-topic handshake tracking.
#[derive(Debug, Default)]
pub struct EndpointSubscriber {
    topics: HashMap<TopicRef, TopicSubscription>,
}

impl EndpointSubscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a subscription for `channel`'s endpoint topic.
    ///
    /// Must be called before the broker subscribe request goes out, since the
    /// challenge can arrive before the request returns. Re-subscribing a
    /// topic restarts its handshake.
    pub fn subscribe(&mut self, topic: TopicRef, channel: &str) {
        debug!(topic = %topic, channel = %channel, "Awaiting subscription confirmation");
        self.topics.insert(
            topic,
            TopicSubscription {
                channel: channel.to_string(),
                state: HandshakeState::Unconfirmed,
                subscription: None,
            },
        );
    }

    /// Route an envelope through the handshake.
    pub fn on_envelope(&mut self, envelope: BrokerEnvelope) -> SubscriberAction {
        let topic = TopicRef::new(envelope.topic_arn());
        let Some(entry) = self.topics.get_mut(&topic) else {
            warn!(
                topic = %topic,
                message_type = %envelope.message_type(),
                "Envelope for unknown topic"
            );
            return SubscriberAction::Ignore;
        };

        match envelope {
            BrokerEnvelope::SubscriptionConfirmation(challenge) => {
                if entry.state != HandshakeState::Unconfirmed {
                    debug!(topic = %topic, state = %entry.state, "Ignoring repeated challenge");
                    return SubscriberAction::Ignore;
                }
                SubscriberAction::Confirm {
                    topic,
                    token: challenge.token,
                }
            }
            BrokerEnvelope::Notification(notification) => {
                if entry.state == HandshakeState::Confirmed {
                    SubscriberAction::Dispatch(notification)
                } else {
                    warn!(
                        topic = %topic,
                        state = %entry.state,
                        message_id = %notification.message_id,
                        "Dropping notification on unconfirmed subscription"
                    );
                    SubscriberAction::Ignore
                }
            }
            BrokerEnvelope::UnsubscribeConfirmation(_) => {
                if entry.state == HandshakeState::Confirmed {
                    info!(topic = %topic, channel = %entry.channel, "Subscription ended");
                    entry.state = HandshakeState::Unsubscribed;
                } else {
                    debug!(topic = %topic, state = %entry.state, "Ignoring unsubscribe notice");
                }
                SubscriberAction::Ignore
            }
        }
    }

    /// Outcome of answering a challenge.
    pub fn on_confirmed(&mut self, topic: &TopicRef, result: Result<SubscriptionRef, String>) {
        let Some(entry) = self.topics.get_mut(topic) else {
            return;
        };
        if entry.state != HandshakeState::Unconfirmed {
            return;
        }
        match result {
            Ok(subscription) => {
                info!(topic = %topic, channel = %entry.channel, "Subscription confirmed");
                entry.state = HandshakeState::Confirmed;
                entry.subscription = Some(subscription);
            }
            Err(e) => {
                warn!(topic = %topic, channel = %entry.channel, error = %e, "Confirmation failed");
                entry.state = HandshakeState::Failed;
            }
        }
    }

    /// The subscribe request itself failed; no challenge will come.
    pub fn on_subscribe_failed(&mut self, topic: &TopicRef, error: &str) {
        if let Some(entry) = self.topics.get_mut(topic) {
            if entry.state == HandshakeState::Unconfirmed {
                warn!(topic = %topic, channel = %entry.channel, error = %error, "Subscribe failed");
                entry.state = HandshakeState::Failed;
            }
        }
    }

    /// Relabel a renamed channel. The topic keeps its name.
    pub fn rename_channel(&mut self, from: &str, to: &str) {
        for entry in self.topics.values_mut() {
            if entry.channel == from {
                entry.channel = to.to_string();
            }
        }
    }

    #[must_use]
    pub fn state(&self, topic: &TopicRef) -> Option<HandshakeState> {
        self.topics.get(topic).map(|e| e.state)
    }

    /// Channel and state of every tracked topic, sorted by channel.
    #[must_use]
    pub fn states(&self) -> Vec<(String, HandshakeState)> {
        let mut states: Vec<_> = self
            .topics
            .values()
            .map(|e| (e.channel.clone(), e.state))
            .collect();
        states.sort();
        states
    }
}
