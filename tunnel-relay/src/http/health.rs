//! Health check endpoint.

use crate::server::TunnelRelay;
use crate::storage::InstanceStorage;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status: "ok", or "degraded" when storage is unreachable.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Instances with a registered socket.
    pub instances_online: usize,
    /// Sessions currently routed.
    pub sessions: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<TunnelRelay>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    let status = match relay.storage().count_online().await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!("Health check storage probe failed: {}", e);
            "degraded"
        }
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instances_online: relay.router().instance_count(),
        sessions: relay.router().session_count(),
        uptime_seconds: uptime,
    })
}
