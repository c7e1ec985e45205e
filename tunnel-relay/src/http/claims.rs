//! Claim code endpoints.
//!
//! Redemption answers with exactly three shapes: 200 with the node, 403
//! `{"error":"denied"}` for any bad code, 429 with the same body when
//! rate limited.

use crate::claims::{RedeemOutcome, Requester};
use crate::error::ClaimError;
use crate::server::{RelayMetrics, TunnelRelay, DENIED};
use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tunnel_types::{ClaimCode, InstanceId};

/// Body of `POST /v1/claim-codes`.
#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    /// Instance id the code will point at.
    pub node_ref: String,
    /// Requested lifetime in seconds.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Reply of `POST /v1/claim-codes`.
#[derive(Debug, Serialize)]
pub struct IssueResponse {
    /// The code.
    pub code: ClaimCode,
    /// Unix seconds after which it is dead.
    pub expires_at: i64,
}

/// Body of `POST /v1/claim-codes/redeem`.
#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    /// Code as typed.
    #[serde(default)]
    pub code: String,
}

/// Reply of a successful redemption.
#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    /// Instance the code pointed at.
    pub node_ref: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn error(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

/// POST /v1/claim-codes
pub async fn issue_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<Arc<TunnelRelay>>,
    Json(request): Json<IssueRequest>,
) -> Response {
    if let Err(e) = relay.rate_limits().check_global() {
        RelayMetrics::bump(&relay.metrics().rate_limit_hits);
        tracing::warn!(%addr, "Issue rejected: {}", e);
        return error(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    let Ok(instance_id) = InstanceId::from_str(request.node_ref.trim()) else {
        return error(StatusCode::BAD_REQUEST, "invalid node_ref");
    };

    let issuer = format!("http:{}", addr.ip());
    match relay
        .issue_code(&instance_id, &issuer, request.ttl_secs.map(Duration::from_secs))
        .await
    {
        Ok(issued) => (
            StatusCode::CREATED,
            Json(IssueResponse {
                code: issued.code,
                expires_at: issued.expires_at,
            }),
        )
            .into_response(),
        Err(ClaimError::UnknownInstance(_)) => error(StatusCode::NOT_FOUND, "unknown node_ref"),
        Err(e) => {
            tracing::error!(instance = ?instance_id, "Could not issue code: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// POST /v1/claim-codes/redeem
pub async fn redeem_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<Arc<TunnelRelay>>,
    Json(request): Json<RedeemRequest>,
) -> Response {
    let requester = Requester {
        ip: addr.ip(),
        identity: format!("http:{}", addr.ip()),
    };

    match relay.redeem(&request.code, &requester).await {
        RedeemOutcome::Granted { instance_ref } => Json(RedeemResponse {
            node_ref: instance_ref.to_string(),
        })
        .into_response(),
        RedeemOutcome::Denied => error(StatusCode::FORBIDDEN, DENIED),
        RedeemOutcome::RateLimited => error(StatusCode::TOO_MANY_REQUESTS, DENIED),
    }
}
