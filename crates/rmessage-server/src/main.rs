//! # rmessage server
//!
//! Real-time message routing server: direct and group messaging with
//! presence, delivery acknowledgments and heartbeats over TCP or WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (tcp on 127.0.0.1:7000)
//! rmessage
//!
//! # Run with environment variables
//! RMESSAGE_PORT=7000 RMESSAGE_HOST=0.0.0.0 rmessage
//!
//! # Override any config field
//! RMESSAGE__TRANSPORT__PROTOCOL=websocket RMESSAGE__CODEC__CHECKSUM=true rmessage
//! ```

mod config;
mod metrics;
mod server;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rmessage=debug,rmessage_core=debug,rmessage_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting rmessage server on {}:{} ({})",
        config.transport.host,
        config.transport.port,
        config.transport.protocol
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    server::run_server(config).await?;

    Ok(())
}
