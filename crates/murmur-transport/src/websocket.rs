//! WebSocket transport over axum.
//!
//! [`attach`] splits an upgraded socket into a [`ChannelConnection`] for the
//! gateway and a [`WebSocketReader`] for the connection task. A writer task
//! drains the connection's queue into the socket as JSON text frames.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_protocol::{codec, ClientFrame};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::{self, ChannelConnection, Outbound};
use crate::traits::TransportError;

/// Reading half of an attached WebSocket.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
    conn: ChannelConnection,
    max_frame_size: usize,
}

/// Attach an upgraded socket.
///
/// Frames larger than `max_frame_size` bytes are rejected by the reader.
#[must_use]
pub fn attach(
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_frame_size: usize,
) -> (ChannelConnection, WebSocketReader) {
    let (sink, stream) = socket.split();
    let (conn, rx) = channel::channel(remote_addr);
    tokio::spawn(write_loop(sink, rx, conn.clone()));

    let reader = WebSocketReader {
        stream,
        conn: conn.clone(),
        max_frame_size,
    };
    (conn, reader)
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    conn: ChannelConnection,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                let text = match codec::encode_frame(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                trace!(bytes = text.len(), "Writing frame");
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    conn.mark_closed();
    let _ = sink.close().await;
    debug!("WebSocket writer finished");
}

impl WebSocketReader {
    /// Next client frame.
    ///
    /// Returns `None` once the peer has closed the socket. A malformed or
    /// oversized frame yields an error but leaves the socket usable.
    pub async fn next_frame(&mut self) -> Option<Result<ClientFrame, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(
                        codec::decode_frame(&text, self.max_frame_size).map_err(Into::into),
                    );
                }
                Some(Ok(Message::Binary(data))) => {
                    // Some clients send JSON as binary frames.
                    let result = match std::str::from_utf8(&data) {
                        Ok(text) => {
                            codec::decode_frame(text, self.max_frame_size).map_err(Into::into)
                        }
                        Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
                    };
                    return Some(result);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Pongs are answered by the socket itself.
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by peer");
                    self.conn.mark_closed();
                    return None;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    self.conn.mark_closed();
                    return None;
                }
            }
        }
    }
}
