//! tunnel-relay binary entry point.
//!
//! Usage:
//! ```bash
//! tunnel-relay --config relay.toml
//! tunnel-relay
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zerok_tunnel_relay::cleanup::spawn_cleanup_task;
use zerok_tunnel_relay::http::{build_router, health};
use zerok_tunnel_relay::{Config, SqliteStorage, TunnelRelay};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match get_config_path() {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            tracing::warn!("No --config given, using defaults");
            Config::default()
        }
    };

    let storage = SqliteStorage::new(std::path::Path::new(&config.storage.database))
        .await
        .with_context(|| format!("Failed to open database {}", config.storage.database.display()))?;

    let bind: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind_address {}", config.server.bind_address))?;
    let cleanup = config.cleanup.clone();

    let relay = Arc::new(TunnelRelay::new(config, storage));
    relay.startup().await.context("Failed to reset registrations")?;
    health::init_start_time();

    let sweeper = spawn_cleanup_task(relay.claims().clone(), relay.rate_limits().clone(), cleanup);

    let app = build_router(relay);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!(
        "tunnel-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Relay server error")?;

    sweeper.abort();
    tracing::info!("tunnel-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn get_config_path() -> Option<PathBuf> {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
}
