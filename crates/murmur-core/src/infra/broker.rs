//! In-memory broker with attribute filter policies.

use async_trait::async_trait;
use dashmap::DashMap;
use murmur_protocol::{
    attr, codec, BrokerEnvelope, MessageAttributes, Notification, SubscriptionConfirmation,
    UnsubscribeConfirmation,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::{Broker, DurableQueue, Endpoint, InfraError, PushSink};
use crate::channel::{QueueRef, SubscriptionRef, TopicRef};
use crate::message::{generate_id, now_millis};

/// Topic ARN prefix.
const TOPIC_ARN_PREFIX: &str = "arn:murmur:topic:";

/// FIFO group used for messages without a channel attribute.
const DEFAULT_GROUP: &str = "default";

/// Attribute allowlist.
///
/// A message matches when, for every key, it carries that attribute and the
/// value is one of the allowed strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterPolicy(BTreeMap<String, Vec<String>>);

impl FilterPolicy {
    /// Empty policy. Matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `{"channel": [name]}`
    #[must_use]
    pub fn channel(name: &str) -> Self {
        Self::new().allow(attr::CHANNEL, [name])
    }

    /// Add allowed values for an attribute.
    #[must_use]
    pub fn allow<I, S>(mut self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .entry(attribute.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Allowed values for an attribute.
    #[must_use]
    pub fn allowed(&self, attribute: &str) -> Option<&[String]> {
        self.0.get(attribute).map(Vec::as_slice)
    }

    /// Whether a message with these attributes passes the policy.
    #[must_use]
    pub fn matches(&self, attributes: &MessageAttributes) -> bool {
        self.0.iter().all(|(name, allowed)| {
            attributes
                .get(name)
                .is_some_and(|value| allowed.iter().any(|a| *a == value.value))
        })
    }
}

#[derive(Debug, Clone)]
enum SubscriptionState {
    PendingConfirmation { token: String },
    Confirmed,
}

struct Subscription {
    endpoint: Endpoint,
    filter: Option<FilterPolicy>,
    state: SubscriptionState,
}

impl Subscription {
    fn accepts(&self, attributes: &MessageAttributes) -> bool {
        matches!(self.state, SubscriptionState::Confirmed)
            && self.filter.as_ref().map_or(true, |f| f.matches(attributes))
    }
}

enum Delivery {
    Queue(QueueRef),
    Push(PushSink),
}

/// Broker keeping topics and subscriptions in memory.
///
/// Queue endpoints are fed through the given [`DurableQueue`], grouped by
/// the message's channel attribute.
pub struct MemoryBroker {
    topics: DashMap<TopicRef, BTreeMap<SubscriptionRef, Subscription>>,
    /// Subscription → owning topic.
    owners: DashMap<SubscriptionRef, TopicRef>,
    queues: Arc<dyn DurableQueue>,
}

impl MemoryBroker {
    /// Create a broker delivering queue subscriptions into `queues`.
    #[must_use]
    pub fn new(queues: Arc<dyn DurableQueue>) -> Self {
        Self {
            topics: DashMap::new(),
            owners: DashMap::new(),
            queues,
        }
    }

    /// Number of subscriptions on a topic.
    #[must_use]
    pub fn subscription_count(&self, topic: &TopicRef) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }

    fn owner(&self, subscription: &SubscriptionRef) -> Result<TopicRef, InfraError> {
        self.owners
            .get(subscription)
            .map(|t| t.value().clone())
            .ok_or_else(|| InfraError::SubscriptionNotFound(subscription.to_string()))
    }

    fn farewell(topic: &TopicRef, subscription: &SubscriptionRef, sink: &PushSink) {
        let notice = BrokerEnvelope::UnsubscribeConfirmation(UnsubscribeConfirmation {
            token: generate_id("token"),
            topic_arn: topic.to_string(),
            message: format!("Subscription {subscription} to {topic} was removed"),
            timestamp: now_millis(),
        });
        if sink.send(notice).is_err() {
            trace!(subscription = %subscription, "Push endpoint already gone");
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_topic(&self, name: &str) -> Result<TopicRef, InfraError> {
        let topic = TopicRef::new(format!("{TOPIC_ARN_PREFIX}{name}"));
        self.topics.entry(topic.clone()).or_insert_with(|| {
            debug!(topic = %topic, "Created topic");
            BTreeMap::new()
        });
        Ok(topic)
    }

    async fn delete_topic(&self, topic: &TopicRef) -> Result<(), InfraError> {
        let Some((_, subscriptions)) = self.topics.remove(topic) else {
            return Ok(());
        };
        for (subscription, sub) in subscriptions {
            self.owners.remove(&subscription);
            if let Endpoint::Push(sink) = &sub.endpoint {
                if matches!(sub.state, SubscriptionState::Confirmed) {
                    Self::farewell(topic, &subscription, sink);
                }
            }
        }
        debug!(topic = %topic, "Deleted topic");
        Ok(())
    }

    async fn topic_exists(&self, topic: &TopicRef) -> bool {
        self.topics.contains_key(topic)
    }

    async fn subscribe(
        &self,
        topic: &TopicRef,
        endpoint: Endpoint,
        filter: Option<FilterPolicy>,
    ) -> Result<SubscriptionRef, InfraError> {
        let mut subscriptions = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| InfraError::TopicNotFound(topic.to_string()))?;

        if let Endpoint::Queue(queue) = &endpoint {
            let existing = subscriptions.iter_mut().find(
                |(_, sub)| matches!(&sub.endpoint, Endpoint::Queue(q) if q == queue),
            );
            if let Some((subscription, sub)) = existing {
                sub.filter = filter;
                debug!(topic = %topic, subscription = %subscription, "Queue already subscribed");
                return Ok(subscription.clone());
            }
        }

        let subscription = SubscriptionRef::new(format!("{topic}:{}", generate_id("sub")));
        let state = match &endpoint {
            Endpoint::Queue(_) => SubscriptionState::Confirmed,
            Endpoint::Push(sink) => {
                let token = generate_id("token");
                let challenge = BrokerEnvelope::SubscriptionConfirmation(SubscriptionConfirmation {
                    token: token.clone(),
                    topic_arn: topic.to_string(),
                    message: format!("Confirm the subscription to {topic}"),
                    timestamp: now_millis(),
                });
                if sink.send(challenge).is_err() {
                    warn!(topic = %topic, "Push endpoint closed before confirmation");
                }
                SubscriptionState::PendingConfirmation { token }
            }
        };

        info!(
            topic = %topic,
            subscription = %subscription,
            protocol = endpoint.protocol(),
            filter = ?filter,
            "Subscribed"
        );
        subscriptions.insert(
            subscription.clone(),
            Subscription {
                endpoint,
                filter,
                state,
            },
        );
        drop(subscriptions);
        self.owners.insert(subscription.clone(), topic.clone());
        Ok(subscription)
    }

    async fn confirm_subscription(
        &self,
        topic: &TopicRef,
        token: &str,
    ) -> Result<SubscriptionRef, InfraError> {
        let mut subscriptions = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| InfraError::TopicNotFound(topic.to_string()))?;

        let (subscription, sub) = subscriptions
            .iter_mut()
            .find(|(_, sub)| {
                matches!(&sub.state, SubscriptionState::PendingConfirmation { token: t } if t == token)
            })
            .ok_or_else(|| InfraError::InvalidToken(topic.to_string()))?;
        sub.state = SubscriptionState::Confirmed;
        debug!(topic = %topic, subscription = %subscription, "Subscription confirmed");
        Ok(subscription.clone())
    }

    async fn unsubscribe(&self, subscription: &SubscriptionRef) -> Result<(), InfraError> {
        let Some((_, topic)) = self.owners.remove(subscription) else {
            return Ok(());
        };
        let removed = self
            .topics
            .get_mut(&topic)
            .and_then(|mut subs| subs.remove(subscription));
        if let Some(sub) = removed {
            if let Endpoint::Push(sink) = &sub.endpoint {
                Self::farewell(&topic, subscription, sink);
            }
            debug!(topic = %topic, subscription = %subscription, "Unsubscribed");
        }
        Ok(())
    }

    async fn set_filter_policy(
        &self,
        subscription: &SubscriptionRef,
        filter: FilterPolicy,
    ) -> Result<(), InfraError> {
        let topic = self.owner(subscription)?;
        let mut subscriptions = self
            .topics
            .get_mut(&topic)
            .ok_or_else(|| InfraError::TopicNotFound(topic.to_string()))?;
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| InfraError::SubscriptionNotFound(subscription.to_string()))?;
        debug!(subscription = %subscription, filter = ?filter, "Filter policy replaced");
        sub.filter = Some(filter);
        Ok(())
    }

    async fn filter_policy(
        &self,
        subscription: &SubscriptionRef,
    ) -> Result<Option<FilterPolicy>, InfraError> {
        let topic = self.owner(subscription)?;
        let subscriptions = self
            .topics
            .get(&topic)
            .ok_or_else(|| InfraError::TopicNotFound(topic.to_string()))?;
        let sub = subscriptions
            .get(subscription)
            .ok_or_else(|| InfraError::SubscriptionNotFound(subscription.to_string()))?;
        Ok(sub.filter.clone())
    }

    async fn publish(
        &self,
        topic: &TopicRef,
        message: String,
        attributes: MessageAttributes,
    ) -> Result<String, InfraError> {
        let notification = Notification {
            message_id: generate_id("msg"),
            topic_arn: topic.to_string(),
            subject: None,
            message,
            timestamp: now_millis(),
            message_attributes: attributes,
        };

        // Collect targets first; the map guard must not be held across the
        // queue sends below.
        let deliveries: Vec<Delivery> = {
            let subscriptions = self
                .topics
                .get(topic)
                .ok_or_else(|| InfraError::TopicNotFound(topic.to_string()))?;
            subscriptions
                .values()
                .filter(|sub| sub.accepts(&notification.message_attributes))
                .map(|sub| match &sub.endpoint {
                    Endpoint::Queue(queue) => Delivery::Queue(queue.clone()),
                    Endpoint::Push(sink) => Delivery::Push(sink.clone()),
                })
                .collect()
        };

        trace!(
            topic = %topic,
            message_id = %notification.message_id,
            deliveries = deliveries.len(),
            "Publishing"
        );

        let group = notification.channel().unwrap_or(DEFAULT_GROUP).to_string();
        for delivery in deliveries {
            match delivery {
                Delivery::Queue(queue) => {
                    let body = codec::encode(&notification)?;
                    if let Err(e) = self.queues.send(&queue, &group, body).await {
                        warn!(topic = %topic, queue = %queue, error = %e, "Queue delivery failed");
                    }
                }
                Delivery::Push(sink) => {
                    if sink
                        .send(BrokerEnvelope::Notification(notification.clone()))
                        .is_err()
                    {
                        debug!(topic = %topic, "Push endpoint closed");
                    }
                }
            }
        }

        Ok(notification.message_id)
    }
}
