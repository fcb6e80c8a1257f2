//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::persist::{PERSISTED_TOTAL, PERSIST_FAILURES_TOTAL};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "murmur_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "murmur_sessions_active";
    pub const MESSAGES_INGESTED: &str = "murmur_messages_ingested_total";
    pub const MESSAGES_FANNED_OUT: &str = "murmur_messages_fanned_out_total";
    pub const CHANNELS_ACTIVE: &str = "murmur_channels_active";
    pub const DISPATCH_LATENCY_SECONDS: &str = "murmur_dispatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of live sessions since start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(
        names::MESSAGES_INGESTED,
        "Messages accepted onto the meta topic"
    );
    metrics::describe_counter!(PERSISTED_TOTAL, "Messages written to a channel table");
    metrics::describe_counter!(
        PERSIST_FAILURES_TOTAL,
        "Failed persistence invocations by kind"
    );
    metrics::describe_counter!(
        names::MESSAGES_FANNED_OUT,
        "Message frames delivered to live sessions"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of ready channels");
    metrics::describe_histogram!(
        names::DISPATCH_LATENCY_SECONDS,
        "Time to fan one notification out to all sessions"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors by type");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new session.
pub fn record_session_opened() {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record a closed session.
pub fn record_session_closed() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Record an accepted submission.
pub fn record_ingested() {
    counter!(names::MESSAGES_INGESTED).increment(1);
}

/// Record one notification fanned out to `recipients` sessions.
pub fn record_fanout(recipients: usize, seconds: f64) {
    counter!(names::MESSAGES_FANNED_OUT).increment(recipients as u64);
    histogram!(names::DISPATCH_LATENCY_SECONDS).record(seconds);
}

/// Update ready channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records session close on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        record_session_opened();
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        record_session_closed();
    }
}
