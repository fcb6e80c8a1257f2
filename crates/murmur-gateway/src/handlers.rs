//! HTTP and WebSocket handlers for the murmur gateway.
//!
//! Channel management and message submission are plain JSON endpoints.
//! Broker push deliveries arrive on the notification path and live clients
//! connect over WebSocket; both are handed to the gateway event loop.

use crate::config::Config;
use crate::gateway::{Gateway, GatewayHandle};
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use murmur_core::{
    Backend, DirectoryError, Infrastructure, IngestError, LookupError, ProvisionError,
};
use murmur_protocol::api::{
    ChannelNameRequest, ChannelQuery, ChannelView, ErrorBody, SendMessageRequest,
    SendMessageResponse, UpdateChannelRequest,
};
use murmur_protocol::{parse_envelope, MessageType, ServerFrame, MESSAGE_TYPE_HEADER};
use murmur_transport::Connection;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// The only `updateChannel` action.
const RENAME_ACTION: &str = "ChangeChannelName";

/// Shared server state.
pub struct AppState {
    /// The routing pipeline.
    pub backend: Arc<Backend>,
    /// The live connection event loop.
    pub gateway: GatewayHandle,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Start the pipeline on in-memory infrastructure.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline, the default channel or the gateway
    /// cannot be started.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        let infra = Infrastructure::in_memory(config.queue());
        Self::with_infrastructure(config, infra).await
    }

    /// Start the pipeline on the given infrastructure.
    ///
    /// # Errors
    ///
    /// See [`AppState::start`].
    pub async fn with_infrastructure(config: Config, infra: Infrastructure) -> Result<Arc<Self>> {
        let backend = Arc::new(
            Backend::start(infra, config.pipeline())
                .await
                .context("Failed to start pipeline")?,
        );

        let default_channel = &config.gateway.default_channel;
        backend
            .provisioner
            .ensure_channel(default_channel)
            .await
            .with_context(|| format!("Failed to provision default channel {default_channel}"))?;

        let gateway = Gateway::start(Arc::clone(&backend), config.gateway.clone())
            .await
            .context("Failed to start gateway")?;

        Ok(Arc::new(Self {
            backend,
            gateway,
            config,
        }))
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.gateway.websocket_path.clone();
    let notification_path = state.config.gateway.notification_path.clone();

    Router::new()
        .route("/sendMessage", post(send_message))
        .route("/getChannel", get(get_channel))
        .route("/createChannel", post(create_channel))
        .route("/updateChannel", post(update_channel))
        .route("/deleteChannel", post(delete_channel))
        .route(&notification_path, post(notifications))
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::start(config.clone()).await?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let gateway = state.gateway.clone();
    let app = router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("murmur gateway listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.gateway.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await?;

    gateway.shutdown();
    Ok(())
}

/// An HTTP error with a JSON `{code, message}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            metrics::record_error(self.code);
        }
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("InvalidBody", rejection.body_text())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match &e {
            IngestError::Validation(_) => Self::bad_request("ValidationError", e.to_string()),
            IngestError::Lookup(LookupError::UnknownChannel(_)) => {
                Self::new(StatusCode::NOT_FOUND, "UnknownChannel", e.to_string())
            }
            IngestError::Lookup(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "LookupFailed", e.to_string())
            }
            IngestError::Publish(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "PublishFailed", e.to_string())
            }
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        match &e {
            ProvisionError::InvalidName(_) => {
                Self::bad_request("InvalidChannelName", e.to_string())
            }
            ProvisionError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "ChannelExists", e.to_string())
            }
            ProvisionError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "ChannelNotFound", e.to_string())
            }
            ProvisionError::Step { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ProvisioningFailed",
                e.to_string(),
            ),
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "DirectoryError", e.to_string())
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `POST /sendMessage`
async fn send_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let Json(request) = payload?;
    let message_id = state.backend.ingest.submit(&request).await?;
    metrics::record_ingested();
    Ok(Json(SendMessageResponse { message_id }))
}

/// `GET /getChannel?type=all`
async fn get_channel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<Vec<ChannelView>>, ApiError> {
    match query.kind.as_deref() {
        Some("all") => {}
        Some(other) => {
            return Err(ApiError::bad_request(
                "UnsupportedType",
                format!("Unsupported channel query type: {other}"),
            ))
        }
        None => return Err(ApiError::bad_request("MissingType", "Missing query parameter: type")),
    }

    let records = state.backend.infra.directory.list().await?;
    Ok(Json(records.iter().map(|r| r.view()).collect()))
}

/// `POST /createChannel`
async fn create_channel(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChannelNameRequest>, JsonRejection>,
) -> Result<Json<ChannelView>, ApiError> {
    let Json(request) = payload?;
    let record = state.backend.provisioner.create_channel(&request.name).await?;

    let view = record.view();
    if let Err(e) = state.gateway.channel_created(record) {
        warn!(channel = %request.name, error = %e, "Gateway not told about new channel");
    }
    Ok(Json(view))
}

/// `POST /updateChannel`
async fn update_channel(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UpdateChannelRequest>, JsonRejection>,
) -> Result<Json<ChannelView>, ApiError> {
    let Json(request) = payload?;
    let update = &request.request;
    if update.action != RENAME_ACTION {
        return Err(ApiError::bad_request(
            "UnsupportedAction",
            format!("Unsupported action: {}", update.action),
        ));
    }
    let [parameters] = update.parameters.as_slice() else {
        return Err(ApiError::bad_request(
            "InvalidParameters",
            format!("{RENAME_ACTION} takes exactly one parameter"),
        ));
    };
    let Some(new_name) = parameters.get("name") else {
        return Err(ApiError::bad_request(
            "InvalidParameters",
            format!("{RENAME_ACTION} requires a name parameter"),
        ));
    };
    if request.channel == state.config.gateway.default_channel {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "DefaultChannel",
            "The default channel cannot be renamed",
        ));
    }

    let record = state
        .backend
        .provisioner
        .rename_channel(&request.channel, new_name)
        .await?;
    if let Err(e) = state.gateway.channel_renamed(&request.channel, &record.name) {
        warn!(channel = %record.name, error = %e, "Gateway not told about rename");
    }
    Ok(Json(record.view()))
}

/// `POST /deleteChannel`
async fn delete_channel(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChannelNameRequest>, JsonRejection>,
) -> Result<Json<ChannelView>, ApiError> {
    let Json(request) = payload?;
    if request.name == state.config.gateway.default_channel {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "DefaultChannel",
            "The default channel cannot be deleted",
        ));
    }

    let record = state.backend.provisioner.delete_channel(&request.name).await?;
    if let Err(e) = state.gateway.channel_deleted(&record.name) {
        warn!(channel = %record.name, error = %e, "Gateway not told about deletion");
    }
    Ok(Json(record.view()))
}

/// Broker push deliveries.
async fn notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let Some(header) = headers
        .get(MESSAGE_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(ApiError::bad_request(
            "MissingMessageType",
            format!("Missing header: {MESSAGE_TYPE_HEADER}"),
        ));
    };

    let message_type = MessageType::from_header(header);
    match parse_envelope(&message_type, &body) {
        Ok(Some(envelope)) => {
            if let Err(e) = state.gateway.deliver(envelope) {
                warn!(message_type = %message_type, error = %e, "Envelope not delivered");
            }
        }
        Ok(None) => warn!(message_type = %message_type, "Ignoring unknown message type"),
        Err(e) => {
            metrics::record_error("protocol");
            warn!(message_type = %message_type, error = %e, "Malformed envelope");
        }
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    account: Option<u64>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let account = params.account.unwrap_or(state.config.gateway.default_account);
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_websocket(socket, state, account, remote_addr))
}

/// Pump one WebSocket into the gateway until it closes.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    account: u64,
    remote_addr: Option<SocketAddr>,
) {
    let _metrics_guard = SessionMetricsGuard::new();

    let (conn, mut reader) =
        murmur_transport::attach(socket, remote_addr, state.config.limits.max_message_size);

    let session = match state.gateway.open(Box::new(conn.clone()), account).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Rejected connection");
            let _ = conn.send(ServerFrame::error(e.to_string()));
            conn.close();
            return;
        }
    };
    debug!(session = %session, account, "WebSocket connected");

    while let Some(result) = reader.next_frame().await {
        match result {
            Ok(frame) => {
                if state.gateway.frame(session.clone(), frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                metrics::record_error("frame");
                debug!(session = %session, error = %e, "Bad client frame");
                let _ = conn.send(ServerFrame::error(format!("Invalid frame: {e}")));
            }
        }
    }

    let _ = state.gateway.close(session.clone());
    debug!(session = %session, "WebSocket disconnected");
}
