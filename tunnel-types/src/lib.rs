//! # tunnel-types
//!
//! Wire format types for the 0k-Tunnel relay pairing protocol.
//!
//! This crate provides the foundational types used across all 0k-Tunnel crates:
//! - [`InstanceId`], [`SessionId`], [`PublicKey`] - Identity and routing types
//! - [`ClaimCode`] - Short-lived pairing codes
//! - [`RelayMessage`] - JSON envelopes exchanged with the relay
//! - [`DeviceInfo`] - Client description carried inside the handshake
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod claim;
mod error;
mod ids;
mod messages;

pub use claim::{ClaimCode, CLAIM_CODE_ALPHABET, CLAIM_CODE_LEN};
pub use error::WireError;
pub use ids::{InstanceId, PublicKey, SessionId, PUBLIC_KEY_LEN};
pub use messages::{DeviceInfo, RelayMessage, DENIED, RATE_LIMITED};
