//! Fan-out of endpoint topic notifications to live sessions.

use murmur_protocol::{attr, Notification, ServerFrame};
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::session::SessionRegistry;

/// Delivers notifications to every session watching their channel.
pub struct FanoutDispatcher {
    registry: SessionRegistry,
}

impl FanoutDispatcher {
    #[must_use]
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    /// Send `notification` to every session subscribed to its channel.
    ///
    /// Returns the number of sessions it reached. Notifications without a
    /// channel attribute reach nobody.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let Some(channel) = notification.channel() else {
            warn!(message_id = %notification.message_id, "Notification without channel");
            return 0;
        };
        let account = notification.attribute(attr::ACCOUNT).unwrap_or_default();

        let start = Instant::now();
        let mut delivered = 0;
        for session in self.registry.iter() {
            if session.subscribed_to() != channel {
                continue;
            }
            match session.send(ServerFrame::message(account, &notification.message)) {
                Ok(()) => delivered += 1,
                // The close event is on its way.
                Err(e) => trace!(session = %session.id(), error = %e, "Skipping closed session"),
            }
        }

        metrics::record_fanout(delivered, start.elapsed().as_secs_f64());
        debug!(channel = %channel, recipients = delivered, "Dispatched notification");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::{AttributeValue, MessageAttributes};
    use murmur_transport::channel::channel;
    use murmur_transport::{ConnectionId, Outbound};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn notification(channel: &str, account: u64, content: &str) -> Notification {
        let mut attributes = MessageAttributes::new();
        attributes.insert(attr::CHANNEL.into(), AttributeValue::string(channel));
        attributes.insert(attr::ACCOUNT.into(), AttributeValue::number(account));
        Notification {
            message_id: "msg_1".into(),
            topic_arn: format!("arn:murmur:topic:{channel}EndpointTopic"),
            subject: None,
            message: content.into(),
            timestamp: 1000,
            message_attributes: attributes,
        }
    }

    fn open(
        dispatcher: &mut FanoutDispatcher,
        channel_name: &str,
    ) -> (ConnectionId, UnboundedReceiver<Outbound>) {
        let (conn, rx) = channel(None);
        let id = dispatcher
            .registry_mut()
            .open(Box::new(conn), 1, vec![channel_name.to_string()])
            .unwrap()
            .id()
            .clone();
        (id, rx)
    }

    #[test]
    fn test_dispatch_matches_channel_exactly() {
        let mut dispatcher = FanoutDispatcher::new(SessionRegistry::new(10));
        let (_, mut alpha) = open(&mut dispatcher, "alpha");
        let (_, mut alpha_prefix) = open(&mut dispatcher, "alph");
        let (_, mut bravo) = open(&mut dispatcher, "bravo");

        assert_eq!(dispatcher.dispatch(&notification("alpha", 1, "hi")), 1);

        assert_eq!(
            alpha.try_recv().unwrap(),
            Outbound::Frame(ServerFrame::message("1", "hi"))
        );
        assert!(alpha_prefix.try_recv().is_err());
        assert!(bravo.try_recv().is_err());
    }

    #[test]
    fn test_each_session_gets_one_copy() {
        let mut dispatcher = FanoutDispatcher::new(SessionRegistry::new(10));
        let (_, mut first) = open(&mut dispatcher, "alpha");
        let (_, mut second) = open(&mut dispatcher, "alpha");

        assert_eq!(dispatcher.dispatch(&notification("alpha", 7, "hey")), 2);
        for rx in [&mut first, &mut second] {
            assert_eq!(
                rx.try_recv().unwrap(),
                Outbound::Frame(ServerFrame::message("7", "hey"))
            );
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_no_dispatch_after_close_or_switch() {
        let mut dispatcher = FanoutDispatcher::new(SessionRegistry::new(10));
        let (closed, _closed_rx) = open(&mut dispatcher, "alpha");
        let (switched, mut switched_rx) = open(&mut dispatcher, "alpha");

        dispatcher.registry_mut().close(&closed);
        dispatcher.registry_mut().switch(&switched, "bravo").unwrap();

        assert_eq!(dispatcher.dispatch(&notification("alpha", 1, "hi")), 0);
        assert!(switched_rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_channel_reaches_nobody() {
        let mut dispatcher = FanoutDispatcher::new(SessionRegistry::new(10));
        let (_, _rx) = open(&mut dispatcher, "alpha");
        let mut bare = notification("alpha", 1, "hi");
        bare.message_attributes.clear();
        assert_eq!(dispatcher.dispatch(&bare), 0);
    }
}
