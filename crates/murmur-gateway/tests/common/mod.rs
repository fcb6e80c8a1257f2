#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use murmur_gateway::{AppState, Config};
use murmur_protocol::api::SendMessageRequest;
use murmur_protocol::{ClientFrame, ServerFrame};
use murmur_transport::channel::channel;
use murmur_transport::{ConnectionId, Outbound};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn app() -> Arc<AppState> {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.pipeline.receive_wait_ms = 100;
    let state = AppState::start(config).await.expect("app state");
    wait_confirmed(&state, "Main").await;
    state
}

/// Wait until the gateway's endpoint subscription for `channel` is live.
pub async fn wait_confirmed(state: &AppState, channel: &str) {
    tokio::time::timeout(WAIT, async {
        loop {
            let status = state.gateway.status().await.expect("status");
            if status.is_confirmed(channel) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("subscription for {channel} never confirmed"));
}

/// Create a channel the way the HTTP handler does.
pub async fn create_channel(state: &AppState, name: &str) {
    let record = state
        .backend
        .provisioner
        .create_channel(name)
        .await
        .expect("create channel");
    state.gateway.channel_created(record).expect("gateway");
    wait_confirmed(state, name).await;
}

pub struct Client {
    pub id: ConnectionId,
    pub rx: UnboundedReceiver<Outbound>,
}

impl Client {
    /// Connect and consume the `connected` frame and the first history.
    pub async fn connect(state: &AppState, account: u64) -> Self {
        let (conn, rx) = channel(None);
        let id = state
            .gateway
            .open(Box::new(conn), account)
            .await
            .expect("open");
        let mut client = Self { id, rx };
        client
            .expect(|f| matches!(f, ServerFrame::Connected { .. }))
            .await;
        client
            .expect(|f| matches!(f, ServerFrame::History { .. }))
            .await;
        client
    }

    pub fn send(&self, state: &AppState, frame: ClientFrame) {
        state
            .gateway
            .frame(self.id.clone(), frame)
            .expect("frame");
    }

    /// Switch channel and wait for the replayed history.
    pub async fn switch(&mut self, state: &AppState, channel: &str) -> ServerFrame {
        self.send(
            state,
            ClientFrame::ChangeChannel {
                channel: channel.into(),
            },
        );
        let channel = channel.to_string();
        self.expect(move |f| matches!(f, ServerFrame::History { channel: c, .. } if *c == channel))
            .await
    }

    pub async fn next(&mut self) -> ServerFrame {
        match tokio::time::timeout(WAIT, self.rx.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    /// Skip frames until one matches.
    pub async fn expect(&mut self, pred: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
        loop {
            let frame = self.next().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Every frame that arrives within `wait`.
    pub async fn drain(&mut self, wait: Duration) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(outbound)) = tokio::time::timeout(wait, self.rx.recv()).await {
            if let Outbound::Frame(frame) = outbound {
                frames.push(frame);
            }
        }
        frames
    }
}

pub fn submission(channel: &str, account: &str, timestamp: u64, message: &str) -> SendMessageRequest {
    SendMessageRequest {
        channel: channel.into(),
        account: account.into(),
        timestamp: timestamp.into(),
        message: message.into(),
    }
}

pub fn is_message(frame: &ServerFrame) -> bool {
    matches!(frame, ServerFrame::Message { .. })
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn read_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}
