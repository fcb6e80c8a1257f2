//! # murmur
//!
//! Channel-scoped chat routing with live fan-out.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! murmur
//!
//! # Run with custom config
//! murmur --config /path/to/murmur.toml
//!
//! # Override single settings
//! MURMUR__PORT=8080 MURMUR__GATEWAY__DEFAULT_CHANNEL=lobby murmur
//! ```

use anyhow::Result;
use clap::Parser;
use murmur_gateway::{handlers, metrics, Config};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "murmur", version, about = "Channel-scoped chat routing with live fan-out")]
struct Args {
    /// Config file. Defaults to the first of the standard locations that exists.
    #[arg(short, long, env = "MURMUR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting murmur on {}:{} (default channel {})",
        config.host,
        config.port,
        config.gateway.default_channel
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
