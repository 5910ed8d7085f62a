//! Type Royale Match Server
//!
//! Authoritative coordination server for two-player typing battles.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use type_royale::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    info!("Type Royale Server v{}", VERSION);
    info!("Bind address: {}", config.bind_addr);
    info!(
        "Disconnect grace: {}s, shield duration: {}ms",
        config.disconnect_grace.as_secs(),
        config.shield_duration.as_millis()
    );

    let server = GameServer::new(config);
    server.run().await.context("server terminated")?;

    Ok(())
}
