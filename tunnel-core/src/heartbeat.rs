//! Ping/pong liveness tracking for the relay socket.

use std::time::Duration;

/// Interval between pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive unanswered pings that declare the socket dead.
pub const DEFAULT_MAX_MISSED_PONGS: u32 = 2;

/// What to do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Socket looks alive; send a ping.
    SendPing,
    /// Too many pongs missed; drop the socket.
    Dead {
        /// Pongs missed in a row.
        missed: u32,
    },
}

/// Counts pongs missed between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    awaiting_pong: bool,
    missed: u32,
    max_missed: u32,
}

impl Heartbeat {
    /// Tracker that gives up after `max_missed` silent ticks.
    pub fn new(max_missed: u32) -> Self {
        Self {
            awaiting_pong: false,
            missed: 0,
            max_missed: max_missed.max(1),
        }
    }

    /// Advance one interval.
    pub fn on_tick(&mut self) -> Beat {
        if self.awaiting_pong {
            self.missed += 1;
            if self.missed >= self.max_missed {
                return Beat::Dead {
                    missed: self.missed,
                };
            }
        }
        self.awaiting_pong = true;
        Beat::SendPing
    }

    /// A pong arrived.
    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
    }

    /// Pongs missed in a row so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Forget all history, e.g. after a fresh registration.
    pub fn reset(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSED_PONGS)
    }
}
