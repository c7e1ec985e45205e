//! Background sweep for expired claim codes.
//!
//! Expiry is enforced at redemption time, so the sweep only bounds table
//! growth. It also lets the rate limiters forget idle addresses.

use crate::claims::ClaimCodeStore;
use crate::config::CleanupConfig;
use crate::limits::RateLimits;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    claims: ClaimCodeStore,
    limits: RateLimits,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;
            sweep_once(&claims, &limits).await;
        }
    })
}

/// One sweep pass.
pub async fn sweep_once(claims: &ClaimCodeStore, limits: &RateLimits) {
    match claims.sweep_expired().await {
        Ok(0) => tracing::debug!("Cleanup: no expired claim codes"),
        Ok(deleted) => tracing::info!("Cleanup: deleted {} expired claim codes", deleted),
        Err(e) => tracing::error!("Cleanup error: {}", e),
    }
    limits.shrink();
}
