//! In-process connection backed by an mpsc channel.
//!
//! Every transport hands the gateway a [`ChannelConnection`]; the receiving
//! half is drained by the transport's writer task, or directly by tests.

use murmur_protocol::ServerFrame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{Connection, TransportError};

/// Work for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close,
}

/// Connection whose frames go into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    remote_addr: Option<SocketAddr>,
}

/// Create a connection and the receiver its frames arrive on.
#[must_use]
pub fn channel(remote_addr: Option<SocketAddr>) -> (ChannelConnection, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = ChannelConnection {
        tx,
        open: Arc::new(AtomicBool::new(true)),
        remote_addr,
    };
    (conn, rx)
}

impl ChannelConnection {
    /// Mark the connection closed without queueing a close.
    ///
    /// Used by the reading side when the peer went away.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Connection for ChannelConnection {
    fn send(&self, frame: ServerFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_queued_in_order() {
        let (conn, mut rx) = channel(None);
        conn.send(ServerFrame::ClearHistory).unwrap();
        conn.send(ServerFrame::message("1", "hi")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(ServerFrame::ClearHistory));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(ServerFrame::message("1", "hi"))
        );
    }

    #[test]
    fn test_close_is_sent_once() {
        let (conn, mut rx) = channel(None);
        conn.close();
        conn.close();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(ServerFrame::ClearHistory),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_dropped_receiver_closes() {
        let (conn, rx) = channel("127.0.0.1:9000".parse().ok());
        assert_eq!(conn.remote_addr().as_deref(), Some("127.0.0.1:9000"));
        drop(rx);
        assert!(!conn.is_open());
    }
}
