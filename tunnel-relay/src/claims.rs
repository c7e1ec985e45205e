//! Claim code issuance and redemption.
//!
//! A claim code is the only secret a client needs to reach an instance, so
//! redemption is built to leak as little as possible:
//!
//! - consumption is a single compare-and-swap statement, so exactly one
//!   concurrent redeemer wins
//! - every failed redemption yields the same [`RedeemOutcome::Denied`],
//!   padded to a minimum latency
//! - attempts are rate limited per source address
//!
//! The internal reason for a denial is only logged.

use crate::clock::Clock;
use crate::config::PairingConfig;
use crate::error::ClaimError;
use crate::limits::RateLimits;
use crate::storage::{ClaimStorage, NewClaim};
use rand::rngs::OsRng;
use rand::Rng;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tunnel_types::{ClaimCode, InstanceId, CLAIM_CODE_ALPHABET, CLAIM_CODE_LEN};

/// Longest lifetime a caller may request for a code.
pub const MAX_CLAIM_TTL: Duration = Duration::from_secs(3600);

/// A freshly issued code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    /// The code to show the user.
    pub code: ClaimCode,
    /// Unix seconds after which it is dead.
    pub expires_at: i64,
}

/// Who is redeeming.
#[derive(Debug, Clone)]
pub struct Requester {
    /// Source address, the rate limit key.
    pub ip: IpAddr,
    /// Recorded as `consumed_by` on success.
    pub identity: String,
}

/// Result of a redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The caller won the code.
    Granted {
        /// Instance the code pointed at.
        instance_ref: InstanceId,
    },
    /// Unknown, malformed, expired or already used. Indistinguishable.
    Denied,
    /// Too many attempts from this address.
    RateLimited,
}

/// Issues and redeems claim codes.
#[derive(Clone)]
pub struct ClaimCodeStore {
    storage: Arc<dyn ClaimStorage>,
    clock: Arc<dyn Clock>,
    limits: RateLimits,
    config: PairingConfig,
}

impl std::fmt::Debug for ClaimCodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimCodeStore")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ClaimCodeStore {
    /// Create a store over `storage`.
    pub fn new(
        storage: Arc<dyn ClaimStorage>,
        clock: Arc<dyn Clock>,
        limits: RateLimits,
        config: PairingConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            limits,
            config,
        }
    }

    /// Issue a code for `instance_ref`.
    ///
    /// `ttl` defaults to the configured lifetime and is capped at
    /// [`MAX_CLAIM_TTL`]. Collisions with live codes are redrawn up to the
    /// configured number of attempts.
    pub async fn generate_code(
        &self,
        instance_ref: &InstanceId,
        issuer: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedCode, ClaimError> {
        let ttl = ttl
            .unwrap_or(Duration::from_secs(self.config.claim_ttl_secs))
            .clamp(Duration::from_secs(1), MAX_CLAIM_TTL);
        let attempts = self.config.max_generate_attempts.max(1);

        for attempt in 1..=attempts {
            let code = draw_code();
            let created_at = self.clock.now();
            let expires_at = created_at + ttl.as_secs() as i64;

            let inserted = self
                .storage
                .insert_code(&NewClaim {
                    code: code.as_str().to_string(),
                    instance_ref: instance_ref.to_string(),
                    issuer: issuer.to_string(),
                    created_at,
                    expires_at,
                })
                .await?;

            if inserted {
                tracing::info!(
                    instance = ?instance_ref,
                    code = ?code,
                    ttl_secs = ttl.as_secs(),
                    "Issued claim code"
                );
                return Ok(IssuedCode { code, expires_at });
            }
            tracing::debug!(attempt, "Claim code collision, redrawing");
        }

        tracing::error!(attempts, "Could not draw a free claim code");
        Err(ClaimError::Exhausted { attempts })
    }

    /// Redeem `raw` on behalf of `requester`.
    ///
    /// Never returns the reason a code was refused.
    pub async fn redeem(&self, raw: &str, requester: &Requester) -> RedeemOutcome {
        let started = Instant::now();

        if let Err(e) = self.limits.check_redeem(requester.ip) {
            tracing::warn!(ip = %requester.ip, "Redeem rejected: {}", e);
            return RedeemOutcome::RateLimited;
        }

        match self.try_redeem(raw, requester).await {
            Ok(instance_ref) => {
                tracing::info!(instance = ?instance_ref, ip = %requester.ip, "Claim code redeemed");
                RedeemOutcome::Granted { instance_ref }
            }
            Err(reason) => {
                log_denial(&reason, requester);
                tokio::time::sleep_until(started + self.config.denial_floor()).await;
                RedeemOutcome::Denied
            }
        }
    }

    async fn try_redeem(&self, raw: &str, requester: &Requester) -> Result<InstanceId, ClaimError> {
        let code = ClaimCode::parse(raw).map_err(|_| ClaimError::Malformed)?;
        let now = self.clock.now();

        match self
            .storage
            .consume_code(code.as_str(), now, &requester.identity)
            .await?
        {
            Some(instance_ref) => InstanceId::from_str(&instance_ref).map_err(|e| {
                tracing::error!("Stored instance_ref is not an instance id: {}", e);
                ClaimError::NotFound
            }),
            None => Err(self.classify(&code, now).await),
        }
    }

    /// Work out why a consume matched no row. For logs only.
    async fn classify(&self, code: &ClaimCode, now: i64) -> ClaimError {
        match self.storage.lookup_code(code.as_str()).await {
            Ok(None) => ClaimError::NotFound,
            Ok(Some(row)) if row.consumed_at.is_some() => ClaimError::AlreadyConsumed,
            Ok(Some(row)) if row.expires_at <= now => ClaimError::Expired,
            // Lost a race that finished between the two statements
            Ok(Some(_)) => ClaimError::AlreadyConsumed,
            Err(e) => ClaimError::Storage(e),
        }
    }

    /// Delete expired codes. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<u64, ClaimError> {
        Ok(self.storage.delete_expired(self.clock.now()).await?)
    }

    /// Codes that could still be redeemed.
    pub async fn pending_codes(&self) -> Result<u64, ClaimError> {
        Ok(self.storage.count_pending(self.clock.now()).await?)
    }
}

/// Draw a code uniformly from the alphabet with the OS CSPRNG.
fn draw_code() -> ClaimCode {
    let mut rng = OsRng;
    loop {
        let indices: Vec<usize> = (0..CLAIM_CODE_LEN)
            .map(|_| rng.gen_range(0..CLAIM_CODE_ALPHABET.len()))
            .collect();
        if let Some(code) = ClaimCode::from_indices(&indices) {
            return code;
        }
    }
}

fn log_denial(reason: &ClaimError, requester: &Requester) {
    let ip = requester.ip;
    match reason {
        ClaimError::NotFound | ClaimError::Malformed => {
            tracing::debug!(%ip, reason = reason.reason(), "Redeem denied");
        }
        ClaimError::Expired => {
            tracing::info!(%ip, reason = reason.reason(), "Redeem denied");
        }
        ClaimError::AlreadyConsumed => {
            tracing::warn!(%ip, reason = reason.reason(), "Redeem denied");
        }
        other => {
            tracing::error!(%ip, "Redeem failed: {}", other);
        }
    }
}
