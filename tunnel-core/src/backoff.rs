//! Reconnect backoff policy.
//!
//! Deterministic exponential backoff: 1s, 2s, 4s, ... capped at 60s, reset
//! after a successful registration. No jitter, so the sequence can be
//! asserted exactly under a paused clock.

use std::time::Duration;

/// First reconnect delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on any reconnect delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a policy doubling from `initial` up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay the next call to [`Backoff::next_delay`] will return.
    pub fn peek(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(delays: &[Duration]) -> Vec<u64> {
        delays.iter().map(|d| d.as_secs()).collect()
    }

    #[test]
    fn default_sequence_doubles_then_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(secs(&delays), vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::default();
        for _ in 0..4 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 4);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn peek_does_not_advance() {
        let backoff = Backoff::default();
        assert_eq!(backoff.peek(), Duration::from_secs(1));
        assert_eq!(backoff.peek(), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let mut backoff = Backoff::default();
        for _ in 0..200 {
            assert!(backoff.next_delay() <= DEFAULT_MAX_BACKOFF);
        }
        assert_eq!(backoff.peek(), DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn custom_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }
}
