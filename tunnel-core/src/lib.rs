//! # tunnel-core
//!
//! Pure logic for 0k-Tunnel (no I/O, instant tests).
//!
//! This crate holds the Noise XX session and the policies that drive an
//! instance's relay link, without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`noise::NoiseSession`] turns handshake payloads into wire messages and back
//! - [`state::RelayLink`] turns link events into actions
//! - [`backoff::Backoff`] and [`heartbeat::Heartbeat`] are the timing policies
//!
//! The actual I/O (sockets, timers) is performed by `tunnel-instance`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod heartbeat;
pub mod noise;
pub mod state;

pub use backoff::{Backoff, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF};
pub use heartbeat::{Beat, Heartbeat, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_MISSED_PONGS};
pub use noise::{CipherState, Keypair, NoiseError, NoiseSession, Role, MAX_MESSAGE_LEN, TAG_LEN};
pub use state::{
    LinkAction, LinkEvent, LinkNotice, LinkState, RelayLink, RetryBudget, DEFAULT_REGISTER_BUDGET,
};
