//! The gateway event loop.
//!
//! One task owns the session registry, the endpoint subscriber and the
//! dispatcher. Everything that happens to them arrives as an [`Event`] on a
//! single channel: connections opening and closing, client frames, broker
//! envelopes and channel changes made over HTTP.
//!
//! The loop never awaits an external service. Publishing, provisioning and
//! history scans run on spawned tasks whose outcome comes back as another
//! event, so one slow call never holds up unrelated sessions. Each session's
//! submissions go through one publisher task, in the order they arrived.

use murmur_core::channel::validate_channel_name;
use murmur_core::infra::{Endpoint, PushSink};
use murmur_core::message::now_millis;
use murmur_core::{Backend, ChannelRecord, IngestHandler, Record, SubscriptionRef, TopicRef};
use murmur_protocol::api::SendMessageRequest;
use murmur_protocol::{BrokerEnvelope, ClientFrame, HistoryEntry, ServerFrame};
use murmur_transport::{Connection, ConnectionId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::GatewayConfig;
use crate::dispatcher::FanoutDispatcher;
use crate::metrics;
use crate::session::{Session, SessionError, SessionRegistry};
use crate::subscriber::{EndpointSubscriber, HandshakeState, SubscriberAction};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway is not running")]
    Stopped,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Everything the event loop reacts to.
pub enum Event {
    /// A client connected.
    Open {
        conn: Box<dyn Connection>,
        account: u64,
        reply: oneshot::Sender<Result<ConnectionId, GatewayError>>,
    },
    /// A client sent a frame.
    Frame {
        session: ConnectionId,
        frame: ClientFrame,
    },
    /// A client went away.
    Close { session: ConnectionId },
    /// A broker envelope for one of the endpoint topics.
    Broker(BrokerEnvelope),
    /// Provisioning finished. `requested_by` is set for `newChannel` frames.
    ChannelProvisioned {
        requested_by: Option<ConnectionId>,
        name: String,
        result: Result<ChannelRecord, String>,
    },
    ChannelRenamed { from: String, to: String },
    ChannelDeleted { name: String },
    /// A `submitMessage` publish finished.
    Submitted {
        session: ConnectionId,
        channel: String,
        result: Result<String, String>,
    },
    /// A history scan finished.
    HistoryLoaded {
        session: ConnectionId,
        channel: String,
        generation: u64,
        result: Result<Vec<Record>, String>,
    },
    /// The push subscribe request for an endpoint topic returned.
    Subscribed {
        topic: TopicRef,
        result: Result<SubscriptionRef, String>,
    },
    /// A confirmation challenge was answered.
    Confirmed {
        topic: TopicRef,
        result: Result<SubscriptionRef, String>,
    },
    Status {
        reply: oneshot::Sender<GatewayStatus>,
    },
    Shutdown,
}

/// One session as seen from outside the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: ConnectionId,
    pub account: u64,
    pub subscribed_to: String,
    pub known_channels: Vec<String>,
}

/// Snapshot of the loop's state.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    /// Sessions, sorted by id.
    pub sessions: Vec<SessionStatus>,
    /// Ready channels in creation order.
    pub channels: Vec<String>,
    /// Endpoint subscription state per channel.
    pub subscriptions: Vec<(String, HandshakeState)>,
}

impl GatewayStatus {
    #[must_use]
    pub fn session(&self, id: &ConnectionId) -> Option<&SessionStatus> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    /// Whether `channel`'s endpoint subscription is confirmed.
    #[must_use]
    pub fn is_confirmed(&self, channel: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|(c, state)| c == channel && *state == HandshakeState::Confirmed)
    }
}

/// Cheap handle for talking to the event loop.
#[derive(Clone)]
pub struct GatewayHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl GatewayHandle {
    fn send(&self, event: Event) -> Result<(), GatewayError> {
        self.events.send(event).map_err(|_| GatewayError::Stopped)
    }

    /// Register a connection. The `connected` frame and the first history
    /// replay are queued on it before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone or the session cannot be opened.
    pub async fn open(
        &self,
        conn: Box<dyn Connection>,
        account: u64,
    ) -> Result<ConnectionId, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Open {
            conn,
            account,
            reply,
        })?;
        rx.await.map_err(|_| GatewayError::Stopped)?
    }

    /// Hand over a client frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub fn frame(&self, session: ConnectionId, frame: ClientFrame) -> Result<(), GatewayError> {
        self.send(Event::Frame { session, frame })
    }

    /// Report a closed connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub fn close(&self, session: ConnectionId) -> Result<(), GatewayError> {
        self.send(Event::Close { session })
    }

    /// Hand over a broker envelope received out of process.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub fn deliver(&self, envelope: BrokerEnvelope) -> Result<(), GatewayError> {
        self.send(Event::Broker(envelope))
    }

    /// Announce a channel created outside a live connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub fn channel_created(&self, record: ChannelRecord) -> Result<(), GatewayError> {
        self.send(Event::ChannelProvisioned {
            requested_by: None,
            name: record.name.clone(),
            result: Ok(record),
        })
    }

    /// Announce a rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub fn channel_renamed(&self, from: &str, to: &str) -> Result<(), GatewayError> {
        self.send(Event::ChannelRenamed {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Announce a deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub fn channel_deleted(&self, name: &str) -> Result<(), GatewayError> {
        self.send(Event::ChannelDeleted {
            name: name.to_string(),
        })
    }

    /// Snapshot of the loop's state.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is gone.
    pub async fn status(&self) -> Result<GatewayStatus, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status { reply })?;
        rx.await.map_err(|_| GatewayError::Stopped)
    }

    /// Stop the loop and close every session.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

/// State owned by the event loop.
pub struct Gateway {
    backend: Arc<Backend>,
    config: GatewayConfig,
    dispatcher: FanoutDispatcher,
    subscriber: EndpointSubscriber,
    /// Ready channels in creation order.
    channels: Vec<String>,
    last_timestamp: u64,
    /// Per-session publisher queues, created on the first submission.
    publishers: HashMap<ConnectionId, mpsc::UnboundedSender<SendMessageRequest>>,
    events: mpsc::UnboundedSender<Event>,
    push: PushSink,
}

impl Gateway {
    /// Subscribe to every ready channel and spawn the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel directory cannot be listed.
    pub async fn start(
        backend: Arc<Backend>,
        config: GatewayConfig,
    ) -> Result<GatewayHandle, murmur_core::DirectoryError> {
        let records = backend.infra.directory.list().await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let mut gateway = Gateway {
            backend,
            dispatcher: FanoutDispatcher::new(SessionRegistry::new(config.max_sessions)),
            config,
            subscriber: EndpointSubscriber::new(),
            channels: Vec::new(),
            last_timestamp: 0,
            publishers: HashMap::new(),
            events: events_tx.clone(),
            push: push_tx,
        };
        for record in &records {
            gateway.add_channel(record);
        }
        info!(channels = gateway.channels.len(), "Gateway started");

        tokio::spawn(gateway.run(events_rx, push_rx));
        Ok(GatewayHandle { events: events_tx })
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut push: mpsc::UnboundedReceiver<BrokerEnvelope>,
    ) {
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(envelope) = push.recv() => Event::Broker(envelope),
                else => break,
            };
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle(event);
        }

        let ids: Vec<_> = self.dispatcher.registry().iter().map(|s| s.id().clone()).collect();
        for id in &ids {
            self.dispatcher.registry_mut().close(id);
        }
        info!(sessions = ids.len(), "Gateway stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Open {
                conn,
                account,
                reply,
            } => {
                let _ = reply.send(self.open(conn, account));
            }
            Event::Frame { session, frame } => self.on_frame(session, frame),
            Event::Close { session } => {
                self.publishers.remove(&session);
                self.dispatcher.registry_mut().close(&session);
            }
            Event::Broker(envelope) => self.on_envelope(envelope),
            Event::ChannelProvisioned {
                requested_by,
                name,
                result,
            } => self.on_provisioned(requested_by, &name, result),
            Event::ChannelRenamed { from, to } => self.on_renamed(&from, &to),
            Event::ChannelDeleted { name } => self.on_deleted(&name),
            Event::Submitted {
                session,
                channel,
                result,
            } => match result {
                Ok(message_id) => {
                    metrics::record_ingested();
                    debug!(session = %session, channel = %channel, message_id = %message_id, "Submitted");
                }
                Err(e) => {
                    metrics::record_error("submit");
                    self.send(&session, ServerFrame::error(format!("Could not send message: {e}")));
                }
            },
            Event::HistoryLoaded {
                session,
                channel,
                generation,
                result,
            } => self.on_history(&session, channel, generation, result),
            Event::Subscribed { topic, result } => match result {
                Ok(subscription) => debug!(topic = %topic, subscription = %subscription, "Subscribe request accepted"),
                Err(e) => self.subscriber.on_subscribe_failed(&topic, &e),
            },
            Event::Confirmed { topic, result } => self.subscriber.on_confirmed(&topic, result),
            Event::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Event::Shutdown => {}
        }
    }

    fn open(
        &mut self,
        conn: Box<dyn Connection>,
        account: u64,
    ) -> Result<ConnectionId, GatewayError> {
        let channels = self.channels.clone();
        let session = self
            .dispatcher
            .registry_mut()
            .open(conn, account, channels.clone())?;

        let id = session.id().clone();
        let subscribed_to = session.subscribed_to().to_string();
        let generation = session.generation();
        let _ = session.send(ServerFrame::Connected {
            session_id: id.to_string(),
            channels,
            subscribed_to: subscribed_to.clone(),
        });

        info!(session = %id, account, channel = %subscribed_to, "Session opened");
        self.load_history(&id, subscribed_to, generation);
        Ok(id)
    }

    fn on_frame(&mut self, id: ConnectionId, frame: ClientFrame) {
        let Some(account) = self.dispatcher.registry().get(&id).map(Session::account) else {
            debug!(session = %id, kind = frame.kind(), "Frame for unknown session");
            return;
        };
        trace!(session = %id, kind = frame.kind(), "Client frame");

        match frame {
            ClientFrame::SubmitMessage { channel, message } => {
                if !self.knows(&channel) {
                    self.send(&id, ServerFrame::error(format!("Unknown channel: {channel}")));
                    return;
                }
                let request = SendMessageRequest {
                    channel,
                    account: account.into(),
                    timestamp: self.next_timestamp().into(),
                    message,
                };
                self.publish(id, request);
            }
            ClientFrame::ChangeChannel { channel } => {
                if !self.knows(&channel) {
                    self.send(&id, ServerFrame::error(format!("Unknown channel: {channel}")));
                    return;
                }
                self.switch(&id, &channel);
            }
            ClientFrame::NewChannel { new_channel } => {
                if let Err(e) = validate_channel_name(&new_channel) {
                    self.send(&id, ServerFrame::error(format!("Invalid channel name: {e}")));
                    return;
                }
                if self.knows(&new_channel) {
                    self.send(
                        &id,
                        ServerFrame::error(format!("Channel already exists: {new_channel}")),
                    );
                    return;
                }
                let provisioner = Arc::clone(&self.backend.provisioner);
                self.spawn(async move {
                    let result = provisioner
                        .create_channel(&new_channel)
                        .await
                        .map_err(|e| e.to_string());
                    Event::ChannelProvisioned {
                        requested_by: Some(id),
                        name: new_channel,
                        result,
                    }
                });
            }
        }
    }

    fn on_envelope(&mut self, envelope: BrokerEnvelope) {
        match self.subscriber.on_envelope(envelope) {
            SubscriberAction::Confirm { topic, token } => {
                let broker = Arc::clone(&self.backend.infra.broker);
                self.spawn(async move {
                    let result = broker
                        .confirm_subscription(&topic, &token)
                        .await
                        .map_err(|e| e.to_string());
                    Event::Confirmed { topic, result }
                });
            }
            SubscriberAction::Dispatch(notification) => {
                self.dispatcher.dispatch(&notification);
            }
            SubscriberAction::Ignore => {}
        }
    }

    fn on_provisioned(
        &mut self,
        requested_by: Option<ConnectionId>,
        name: &str,
        result: Result<ChannelRecord, String>,
    ) {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                metrics::record_error("provision");
                if let Some(id) = requested_by {
                    self.send(&id, ServerFrame::error(format!("Could not create channel {name}: {e}")));
                }
                return;
            }
        };
        self.add_channel(&record);

        let Some(id) = requested_by else {
            return;
        };
        match self.dispatcher.registry_mut().add_channel(&id, &record.name) {
            Ok(generation) => {
                self.send(&id, ServerFrame::ChannelCreated { channel: record.name.clone() });
                self.send(&id, ServerFrame::ClearHistory);
                self.load_history(&id, record.name, generation);
            }
            Err(e) => debug!(session = %id, error = %e, "Creator left before provisioning finished"),
        }
    }

    fn on_renamed(&mut self, from: &str, to: &str) {
        for name in &mut self.channels {
            if name == from {
                *name = to.to_string();
            }
        }
        self.subscriber.rename_channel(from, to);
        for id in self.dispatcher.registry_mut().rename_channel(from, to) {
            self.send(
                &id,
                ServerFrame::ChannelRenamed {
                    from: from.to_string(),
                    to: to.to_string(),
                },
            );
        }
        info!(from = %from, to = %to, "Channel renamed");
    }

    fn on_deleted(&mut self, name: &str) {
        self.channels.retain(|c| c != name);
        metrics::set_active_channels(self.channels.len());

        let fallback = self.config.default_channel.clone();
        for (id, channel, generation) in self.dispatcher.registry_mut().remove_channel(name, &fallback) {
            self.send(&id, ServerFrame::ClearHistory);
            self.send(&id, ServerFrame::ChannelChanged { channel: channel.clone() });
            self.load_history(&id, channel, generation);
        }
        info!(channel = %name, "Channel removed");
    }

    fn on_history(
        &mut self,
        id: &ConnectionId,
        channel: String,
        generation: u64,
        result: Result<Vec<Record>, String>,
    ) {
        let current = self
            .dispatcher
            .registry()
            .get(id)
            .is_some_and(|s| s.generation() == generation && s.subscribed_to() == channel);
        if !current {
            debug!(session = %id, channel = %channel, "Discarding stale history");
            return;
        }

        match result {
            Ok(records) => {
                let messages = records
                    .into_iter()
                    .map(|r| HistoryEntry {
                        account_id: r.account.to_string(),
                        content: r.content,
                        timestamp: r.timestamp,
                    })
                    .collect();
                self.send(id, ServerFrame::History { channel, messages });
            }
            Err(e) => {
                warn!(session = %id, channel = %channel, error = %e, "History load failed");
                self.send(id, ServerFrame::error(format!("Could not load history for {channel}")));
            }
        }
    }

    fn switch(&mut self, id: &ConnectionId, channel: &str) {
        match self.dispatcher.registry_mut().switch(id, channel) {
            Ok(generation) => {
                debug!(session = %id, channel = %channel, "Switched channel");
                self.send(id, ServerFrame::ClearHistory);
                self.send(id, ServerFrame::ChannelChanged { channel: channel.to_string() });
                self.load_history(id, channel.to_string(), generation);
            }
            Err(e) => debug!(session = %id, error = %e, "Switch for unknown session"),
        }
    }

    fn add_channel(&mut self, record: &ChannelRecord) {
        if self.knows(&record.name) {
            return;
        }
        self.channels.push(record.name.clone());
        metrics::set_active_channels(self.channels.len());

        let Some(topic) = record.resources.endpoint_topic.clone() else {
            warn!(channel = %record.name, "Ready channel without endpoint topic");
            return;
        };
        self.subscriber.subscribe(topic.clone(), &record.name);

        let broker = Arc::clone(&self.backend.infra.broker);
        let sink = self.push.clone();
        self.spawn(async move {
            let result = broker
                .subscribe(&topic, Endpoint::Push(sink), None)
                .await
                .map_err(|e| e.to_string());
            Event::Subscribed { topic, result }
        });
    }

    fn load_history(&self, id: &ConnectionId, channel: String, generation: u64) {
        let backend = Arc::clone(&self.backend);
        let limit = self.config.history_limit;
        let session = id.clone();
        self.spawn(async move {
            let result = backend
                .history(&channel, limit)
                .await
                .map_err(|e| e.to_string());
            Event::HistoryLoaded {
                session,
                channel,
                generation,
                result,
            }
        });
    }

    fn status(&self) -> GatewayStatus {
        let mut sessions: Vec<_> = self
            .dispatcher
            .registry()
            .iter()
            .map(|s| SessionStatus {
                id: s.id().clone(),
                account: s.account(),
                subscribed_to: s.subscribed_to().to_string(),
                known_channels: s.known_channels().to_vec(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        GatewayStatus {
            sessions,
            channels: self.channels.clone(),
            subscriptions: self.subscriber.states(),
        }
    }

    fn knows(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// Strictly increasing, so one account never produces two records with
    /// the same key.
    fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp = now_millis().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn send(&self, id: &ConnectionId, frame: ServerFrame) {
        if let Some(session) = self.dispatcher.registry().get(id) {
            if let Err(e) = session.send(frame) {
                trace!(session = %id, error = %e, "Dropping frame for closed session");
            }
        }
    }

    fn publish(&mut self, id: ConnectionId, request: SendMessageRequest) {
        let ingest = self.backend.ingest.clone();
        let events = self.events.clone();
        let publisher = self.publishers.entry(id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(publish_in_order(id.clone(), ingest, rx, events));
            tx
        });
        if publisher.send(request).is_err() {
            warn!(session = %id, "Publisher task gone");
            self.publishers.remove(&id);
            metrics::record_error("submit");
            self.send(&id, ServerFrame::error("Could not send message"));
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(task.await);
        });
    }
}

/// Publish one session's submissions one after another. Ends when the
/// session closes and its sender is dropped.
async fn publish_in_order(
    session: ConnectionId,
    ingest: IngestHandler,
    mut requests: mpsc::UnboundedReceiver<SendMessageRequest>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(request) = requests.recv().await {
        let result = ingest.submit(&request).await.map_err(|e| e.to_string());
        let done = Event::Submitted {
            session: session.clone(),
            channel: request.channel,
            result,
        };
        if events.send(done).is_err() {
            break;
        }
    }
}
