//! Prometheus metrics endpoint.

use crate::server::TunnelRelay;
use axum::http::StatusCode;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
/// Returns 404 when metrics are disabled in config.
pub async fn metrics_handler(Extension(relay): Extension<Arc<TunnelRelay>>) -> impl IntoResponse {
    if !relay.config().http.metrics_enabled {
        return (StatusCode::NOT_FOUND, [(CONTENT_TYPE, "text/plain")], String::new());
    }

    let m = relay.metrics();

    let instances = relay.router().instance_count();
    let sessions = relay.router().session_count();
    // Best effort, a storage hiccup reports zero
    let pending = relay.claims().pending_codes().await.unwrap_or(0);

    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let registrations = m.registrations_total.load(Ordering::Relaxed);
    let issued = m.codes_issued_total.load(Ordering::Relaxed);
    let granted = m.redemptions_granted_total.load(Ordering::Relaxed);
    let denied = m.redemptions_denied_total.load(Ordering::Relaxed);
    let opened = m.sessions_opened_total.load(Ordering::Relaxed);
    let frames = m.frames_relayed_total.load(Ordering::Relaxed);
    let bytes = m.bytes_relayed_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP tunnel_relay_instances_online Instances with a registered socket
# TYPE tunnel_relay_instances_online gauge
tunnel_relay_instances_online {instances}

# HELP tunnel_relay_sessions_active Sessions currently routed
# TYPE tunnel_relay_sessions_active gauge
tunnel_relay_sessions_active {sessions}

# HELP tunnel_relay_claim_codes_pending Claim codes that can still be redeemed
# TYPE tunnel_relay_claim_codes_pending gauge
tunnel_relay_claim_codes_pending {pending}

# HELP tunnel_relay_info Server information
# TYPE tunnel_relay_info gauge
tunnel_relay_info{{version="{version}"}} 1

# HELP tunnel_relay_connections_total Total sockets accepted
# TYPE tunnel_relay_connections_total counter
tunnel_relay_connections_total {conns_total}

# HELP tunnel_relay_registrations_total Total successful instance registrations
# TYPE tunnel_relay_registrations_total counter
tunnel_relay_registrations_total {registrations}

# HELP tunnel_relay_claim_codes_issued_total Total claim codes issued
# TYPE tunnel_relay_claim_codes_issued_total counter
tunnel_relay_claim_codes_issued_total {issued}

# HELP tunnel_relay_redemptions_granted_total Total redemptions that won a code
# TYPE tunnel_relay_redemptions_granted_total counter
tunnel_relay_redemptions_granted_total {granted}

# HELP tunnel_relay_redemptions_denied_total Total redemptions refused
# TYPE tunnel_relay_redemptions_denied_total counter
tunnel_relay_redemptions_denied_total {denied}

# HELP tunnel_relay_sessions_opened_total Total sessions opened
# TYPE tunnel_relay_sessions_opened_total counter
tunnel_relay_sessions_opened_total {opened}

# HELP tunnel_relay_frames_relayed_total Total frames forwarded
# TYPE tunnel_relay_frames_relayed_total counter
tunnel_relay_frames_relayed_total {frames}

# HELP tunnel_relay_bytes_relayed_total Total opaque payload bytes forwarded
# TYPE tunnel_relay_bytes_relayed_total counter
tunnel_relay_bytes_relayed_total {bytes}

# HELP tunnel_relay_rate_limit_hits_total Total rate limit rejections
# TYPE tunnel_relay_rate_limit_hits_total counter
tunnel_relay_rate_limit_hits_total {rate_limits}

# HELP tunnel_relay_errors_total Total protocol errors
# TYPE tunnel_relay_errors_total counter
tunnel_relay_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
