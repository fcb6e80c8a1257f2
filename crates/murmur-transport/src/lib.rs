//! # murmur-transport
//!
//! Live client connections for the murmur gateway.
//!
//! The gateway never touches a socket. It holds a [`Connection`] per
//! session and queues [`ServerFrame`](murmur_protocol::ServerFrame)s on it;
//! the transport writes them out.
//!
//! - [`channel`] - mpsc-backed connection, also used in tests
//! - [`websocket`] - axum WebSocket reader and writer
//!
//! ```rust
//! use murmur_protocol::ServerFrame;
//! use murmur_transport::{channel, Connection, Outbound};
//!
//! let (conn, mut rx) = channel::channel(None);
//! conn.send(ServerFrame::ClearHistory).unwrap();
//! assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(ServerFrame::ClearHistory));
//! ```

pub mod channel;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ChannelConnection, Outbound};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{attach, WebSocketReader};
