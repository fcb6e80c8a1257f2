//! # murmur-gateway
//!
//! The process that clients talk to.
//!
//! - [`handlers`] - axum routes for channel management, submissions, broker
//!   push deliveries and WebSocket upgrades
//! - [`gateway`] - the single-task event loop that owns all live sessions
//! - [`session`], [`subscriber`], [`dispatcher`] - the state that loop keeps
//! - [`config`], [`metrics`] - configuration loading and Prometheus export

pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod session;
pub mod subscriber;

pub use config::Config;
pub use gateway::{Event, Gateway, GatewayError, GatewayHandle, GatewayStatus};
pub use handlers::{router, run_server, AppState};
