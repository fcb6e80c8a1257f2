//! Live session bookkeeping.
//!
//! A session is one open client connection plus the channel it currently
//! watches. The registry is owned by the gateway event loop and never shared,
//! so it needs no locking.

use murmur_protocol::ServerFrame;
use murmur_transport::{Connection, ConnectionId, TransportError};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Session registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session limit reached ({0})")]
    Full(usize),

    #[error("No channels to subscribe to")]
    NoChannels,
}

/// One live client.
pub struct Session {
    id: ConnectionId,
    conn: Box<dyn Connection>,
    account: u64,
    known_channels: Vec<String>,
    subscribed_to: String,
    /// Bumped on every subscription change. History loads carry the value
    /// they were started with and are dropped if it moved on.
    generation: u64,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn account(&self) -> u64 {
        self.account
    }

    #[must_use]
    pub fn known_channels(&self) -> &[String] {
        &self.known_channels
    }

    #[must_use]
    pub fn subscribed_to(&self) -> &str {
        &self.subscribed_to
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame on the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already closed.
    pub fn send(&self, frame: ServerFrame) -> Result<(), TransportError> {
        self.conn.send(frame)
    }

    fn subscribe(&mut self, channel: &str) -> u64 {
        if !self.known_channels.iter().any(|c| c == channel) {
            self.known_channels.push(channel.to_string());
        }
        self.subscribed_to = channel.to_string();
        self.generation += 1;
        self.generation
    }
}

/// Sessions by id.
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Register a connection. The session starts on the first of `channels`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is full or `channels` is empty.
    pub fn open(
        &mut self,
        conn: Box<dyn Connection>,
        account: u64,
        channels: Vec<String>,
    ) -> Result<&Session, SessionError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::Full(self.max_sessions));
        }
        let first = channels.first().cloned().ok_or(SessionError::NoChannels)?;

        let mut id = ConnectionId::generate();
        while self.sessions.contains_key(&id) {
            id = ConnectionId::generate();
        }

        debug!(session = %id, channel = %first, "Session opened");
        let session = Session {
            id: id.clone(),
            conn,
            account,
            known_channels: channels,
            subscribed_to: first,
            generation: 0,
        };
        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Remove a session and close its connection.
    pub fn close(&mut self, id: &ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        session.conn.close();
        debug!(session = %id, "Session closed");
        Some(session)
    }

    /// Point a session at another channel.
    ///
    /// Returns the session's new generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist.
    pub fn switch(&mut self, id: &ConnectionId, channel: &str) -> Result<u64, SessionError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(session.subscribe(channel))
    }

    /// Record a channel the session created and switch to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist.
    pub fn add_channel(&mut self, id: &ConnectionId, channel: &str) -> Result<u64, SessionError> {
        self.switch(id, channel)
    }

    /// Rewrite a renamed channel everywhere. Returns the sessions that knew it.
    pub fn rename_channel(&mut self, from: &str, to: &str) -> Vec<ConnectionId> {
        let mut affected = Vec::new();
        for session in self.sessions.values_mut() {
            let mut knew = false;
            for name in &mut session.known_channels {
                if name == from {
                    *name = to.to_string();
                    knew = true;
                }
            }
            if session.subscribed_to == from {
                session.subscribed_to = to.to_string();
                knew = true;
            }
            if knew {
                affected.push(session.id.clone());
            }
        }
        affected
    }

    /// Forget a deleted channel.
    ///
    /// Sessions watching it move to their first remaining known channel, or to
    /// `fallback` if none is left. Returns the moved sessions with their new
    /// channel and generation.
    pub fn remove_channel(
        &mut self,
        name: &str,
        fallback: &str,
    ) -> Vec<(ConnectionId, String, u64)> {
        let mut moved = Vec::new();
        for session in self.sessions.values_mut() {
            session.known_channels.retain(|c| c != name);
            if session.subscribed_to != name {
                continue;
            }
            let next = session
                .known_channels
                .first()
                .cloned()
                .unwrap_or_else(|| fallback.to_string());
            let generation = session.subscribe(&next);
            moved.push((session.id.clone(), next, generation));
        }
        moved
    }

    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
