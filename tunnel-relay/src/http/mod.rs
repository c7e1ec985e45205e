//! HTTP endpoints for tunnel-relay.
//!
//! Health, metrics, claim code issue/redeem and the two WebSocket routes.
//! Handlers need `ConnectInfo<SocketAddr>`, so serve the router with
//! `into_make_service_with_connect_info::<SocketAddr>()`.

mod claims;
pub mod health;
mod metrics;

use crate::server::TunnelRelay;
use crate::ws;
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::sync::Arc;

pub use claims::{IssueRequest, IssueResponse, RedeemRequest, RedeemResponse};
pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<TunnelRelay>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/claim-codes", post(claims::issue_handler))
        .route("/v1/claim-codes/redeem", post(claims::redeem_handler))
        .route("/v1/instance", get(ws::instance_upgrade))
        .route("/v1/client", get(ws::client_upgrade))
        .layer(Extension(relay))
}
