//! Rate limiting for tunnel-relay.
//!
//! Token buckets keyed by the caller's IP address:
//! - **redeem** guards claim code guessing (default 5/min)
//! - **register** guards instance registration churn (default 10/min)
//!
//! A direct limiter caps aggregate throughput on top. All of these use the
//! governor crate, keyed limiters backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    redeem_limiter: Arc<KeyedLimiter<IpAddr>>,
    register_limiter: Arc<KeyedLimiter<IpAddr>>,
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("redeem_keys", &self.redeem_limiter.len())
            .field("register_keys", &self.register_limiter.len())
            .finish_non_exhaustive()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are treated as one; a relay that admits nothing is
    /// never what the operator meant.
    pub fn new(config: &LimitsConfig) -> Self {
        let redeem_quota = Quota::per_minute(non_zero(config.redeem_per_minute));
        let register_quota = Quota::per_minute(non_zero(config.register_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            redeem_limiter: Arc::new(RateLimiter::keyed(redeem_quota)),
            register_limiter: Arc::new(RateLimiter::keyed(register_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a redemption attempt from `ip` is allowed.
    pub fn check_redeem(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.redeem_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::RedeemLimitExceeded)
    }

    /// Check if an instance registration from `ip` is allowed.
    pub fn check_register(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.register_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::RegisterLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked redeem keys (for metrics).
    pub fn redeem_keys_count(&self) -> usize {
        self.redeem_limiter.len()
    }

    /// Number of tracked register keys (for metrics).
    pub fn register_keys_count(&self) -> usize {
        self.register_limiter.len()
    }

    /// Evict idle entries from the keyed limiters.
    ///
    /// `retain_recent()` drops keys whose buckets have fully recharged.
    /// Called from the cleanup task.
    pub fn shrink(&self) {
        self.redeem_limiter.retain_recent();
        self.register_limiter.retain_recent();
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many redemption attempts from this address.
    RedeemLimitExceeded,
    /// Too many registrations from this address.
    RegisterLimitExceeded,
    /// Global request rate exceeded across all clients.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RedeemLimitExceeded => write!(f, "redeem rate limit exceeded"),
            Self::RegisterLimitExceeded => write!(f, "register rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn config(redeem: u32, register: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            redeem_per_minute: redeem,
            register_per_minute: register,
            global_requests_per_second: global,
            ..LimitsConfig::default()
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn create_rate_limits() {
        let limits = RateLimits::new(&LimitsConfig::default());
        assert_eq!(limits.redeem_keys_count(), 0);
        assert_eq!(limits.register_keys_count(), 0);
    }

    #[test]
    fn redeem_limit_defaults_to_five_per_minute() {
        let limits = RateLimits::new(&LimitsConfig::default());
        for _ in 0..5 {
            assert!(limits.check_redeem(ip(1)).is_ok());
        }
        assert_eq!(
            limits.check_redeem(ip(1)),
            Err(RateLimitError::RedeemLimitExceeded)
        );
    }

    #[test]
    fn register_limit_defaults_to_ten_per_minute() {
        let limits = RateLimits::new(&LimitsConfig::default());
        for _ in 0..10 {
            assert!(limits.check_register(ip(1)).is_ok());
        }
        assert_eq!(
            limits.check_register(ip(1)),
            Err(RateLimitError::RegisterLimitExceeded)
        );
    }

    #[test]
    fn buckets_are_independent() {
        let limits = RateLimits::new(&config(2, 2, 1000));

        assert!(limits.check_redeem(ip(1)).is_ok());
        assert!(limits.check_redeem(ip(1)).is_ok());
        assert!(limits.check_redeem(ip(1)).is_err());

        // Other address, other bucket
        assert!(limits.check_redeem(ip(2)).is_ok());
        // Registration budget untouched by redeems
        assert!(limits.check_register(ip(1)).is_ok());

        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(limits.check_redeem(v6).is_ok());
    }

    #[test]
    fn global_rate_limiter_rejects_excess() {
        let limits = RateLimits::new(&config(100, 100, 5));
        for i in 0..5 {
            assert!(limits.check_redeem(ip(i)).is_ok());
        }
        assert_eq!(
            limits.check_redeem(ip(99)),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn zero_quota_is_clamped() {
        let limits = RateLimits::new(&config(0, 0, 0));
        assert!(limits.check_redeem(ip(1)).is_ok());
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::RedeemLimitExceeded.to_string(),
            "redeem rate limit exceeded"
        );
        assert_eq!(
            RateLimitError::GlobalLimitExceeded.to_string(),
            "global rate limit exceeded"
        );
    }

    #[test]
    fn shrink_does_not_panic() {
        let limits = RateLimits::new(&LimitsConfig::default());
        let _ = limits.check_redeem(ip(1));
        let _ = limits.check_register(ip(2));
        assert!(limits.redeem_keys_count() > 0);
        limits.shrink();
    }
}
