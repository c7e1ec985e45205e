//! # tunnel-relay
//!
//! Untrusted pairing relay for 0k-Tunnel.
//!
//! The relay:
//! - Accepts WebSocket registrations from instances
//! - Issues short-lived, single-use claim codes
//! - Turns a redeemed code into a routed session between client and instance
//! - Forwards opaque frames and never sees plaintext
//!
//! ## Architecture
//!
//! ```text
//! Client ──┐                          ┌── Instance
//!          │  /v1/client  /v1/instance│
//!          ├─────────────────────────►│
//!          │      frame{session_id}   │
//!      ┌───┴──────────────────────────┴───┐
//!      │           tunnel-relay           │
//!      │  ClaimCodeStore  MessageRouter   │
//!      │  ┌────────────────────────────┐  │
//!      │  │ SQLite (codes, instances)  │  │
//!      │  └────────────────────────────┘  │
//!      └──────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! JSON envelopes tagged by `type` (see `tunnel_types::RelayMessage`):
//! - register → registered, then ping/pong
//! - issue_code → claim_code
//! - redeem → paired, with connection sent to the instance
//! - frame / close in both directions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod claims;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod ws;

pub use claims::{ClaimCodeStore, IssuedCode, RedeemOutcome, Requester};
pub use config::Config;
pub use router::{RelayMessageRouter, SessionState};
pub use server::TunnelRelay;
pub use storage::SqliteStorage;
