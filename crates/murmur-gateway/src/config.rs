//! Gateway configuration.
//!
//! Configuration is layered:
//! - built-in defaults
//! - a TOML file (`--config <path>`, or the first of `murmur.toml`,
//!   `/etc/murmur/murmur.toml`, `~/.config/murmur/murmur.toml`)
//! - environment variables prefixed `MURMUR__`, with `__` between sections
//!   (`MURMUR__GATEWAY__DEFAULT_CHANNEL=lobby`)

use anyhow::{bail, Context, Result};
use murmur_core::channel::validate_channel_name;
use murmur_core::infra::QueueConfig;
use murmur_core::{PipelineConfig, ProvisionConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "murmur.toml",
    "/etc/murmur/murmur.toml",
    "~/.config/murmur/murmur.toml",
];

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Live connection and session settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Queue and provisioning settings.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Live connection and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Channel created at startup and used as the last-resort fallback.
    #[serde(default = "default_channel")]
    pub default_channel: String,

    /// Account used for live connections that do not name one.
    #[serde(default = "default_account")]
    pub default_account: u64,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Path for broker push deliveries.
    #[serde(default = "default_notification_path")]
    pub notification_path: String,

    /// Records replayed on channel switch.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Queue and provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Budget for one persistence invocation.
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_ms: u64,

    /// Messages requested per queue receive.
    #[serde(default = "default_receive_batch")]
    pub receive_batch: usize,

    /// Long-poll wait per queue receive.
    #[serde(default = "default_receive_wait")]
    pub receive_wait_ms: u64,

    /// Receives before a message is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// How long a received message stays invisible to other consumers.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_ms: u64,

    /// How long the provisioning self-check waits for its canary.
    #[serde(default = "default_canary_timeout")]
    pub canary_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum live frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_channel() -> String {
    "Main".to_string()
}

fn default_account() -> u64 {
    1
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_notification_path() -> String {
    "/notifications".to_string()
}

fn default_history_limit() -> usize {
    50
}

fn default_max_sessions() -> usize {
    100_000
}

fn default_processing_timeout() -> u64 {
    5_000
}

fn default_receive_batch() -> usize {
    10
}

fn default_receive_wait() -> u64 {
    1_000
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_visibility_timeout() -> u64 {
    30_000
}

fn default_canary_timeout() -> u64 {
    2_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gateway: GatewayConfig::default(),
            pipeline: PipelineSettings::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_channel: default_channel(),
            default_account: default_account(),
            websocket_path: default_ws_path(),
            notification_path: default_notification_path(),
            history_limit: default_history_limit(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            processing_timeout_ms: default_processing_timeout(),
            receive_batch: default_receive_batch(),
            receive_wait_ms: default_receive_wait(),
            max_receive_count: default_max_receive_count(),
            visibility_timeout_ms: default_visibility_timeout(),
            canary_timeout_ms: default_canary_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists, with environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file is missing, a file or an
    /// override cannot be parsed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Some(path.to_path_buf())
            }
            None => CONFIG_PATHS
                .iter()
                .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
                .find(|p| p.exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(
                config::File::from(file.as_path()).format(config::FileFormat::Toml),
            );
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("MURMUR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        validate_channel_name(&self.gateway.default_channel)
            .map_err(|e| anyhow::anyhow!("gateway.default_channel: {e}"))?;
        if !self.gateway.websocket_path.starts_with('/') {
            bail!("gateway.websocket_path must start with '/'");
        }
        if !self.gateway.notification_path.starts_with('/') {
            bail!("gateway.notification_path must start with '/'");
        }
        if self.gateway.history_limit == 0 {
            bail!("gateway.history_limit must be at least 1");
        }
        if self.gateway.max_sessions == 0 {
            bail!("gateway.max_sessions must be at least 1");
        }
        if self.pipeline.receive_batch == 0 {
            bail!("pipeline.receive_batch must be at least 1");
        }
        if self.pipeline.max_receive_count == 0 {
            bail!("pipeline.max_receive_count must be at least 1");
        }
        if self.pipeline.processing_timeout_ms == 0 {
            bail!("pipeline.processing_timeout_ms must be positive");
        }
        if self.limits.max_message_size == 0 {
            bail!("limits.max_message_size must be positive");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Queue behaviour for the in-memory queue.
    #[must_use]
    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_receive_count: self.pipeline.max_receive_count,
            visibility_timeout: Duration::from_millis(self.pipeline.visibility_timeout_ms),
        }
    }

    /// Worker and provisioning tuning.
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        let p = &self.pipeline;
        PipelineConfig {
            worker: WorkerConfig {
                receive_batch: p.receive_batch,
                receive_wait: Duration::from_millis(p.receive_wait_ms),
                processing_timeout: Duration::from_millis(p.processing_timeout_ms),
            },
            provision: ProvisionConfig {
                canary_timeout: Duration::from_millis(p.canary_timeout_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.gateway.default_channel, "Main");
        assert_eq!(config.gateway.history_limit, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let broken = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(broken.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [gateway]
            default_channel = "lobby"

            [pipeline]
            max_receive_count = 3
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.gateway.default_channel, "lobby");
        assert_eq!(config.gateway.websocket_path, "/ws");
        assert_eq!(config.queue().max_receive_count, 3);
        assert_eq!(
            config.pipeline().worker.processing_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.gateway.default_channel = "has space".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.receive_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/murmur.toml"))).is_err());
    }
}
