//! Relay envelopes for 0k-Tunnel.
//!
//! Every message exchanged with the relay is a JSON object tagged by
//! `type`. Tunnel payloads travel inside [`RelayMessage::Frame`] as base64
//! and are opaque to the relay.

use serde::{Deserialize, Serialize};

use crate::{ClaimCode, InstanceId, PublicKey, SessionId, WireError};

/// Error text for any refused redemption.
pub const DENIED: &str = "denied";

/// Error text when the caller is over its redemption quota.
pub const RATE_LIMITED: &str = "rate_limited";

/// All messages on a relay socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Instance announces itself on a fresh socket.
    Register {
        /// Stable instance identifier
        instance_id: InstanceId,
        /// Instance static key
        public_key: PublicKey,
        /// Candidate endpoints, most preferred first
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        addresses: Vec<String>,
    },
    /// Relay accepted the registration.
    Registered,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Relay tells an instance that a client redeemed one of its codes.
    Connection {
        /// Session the client was assigned
        session_id: SessionId,
        /// Key the client will prove during the handshake
        client_public_key: PublicKey,
    },
    /// Generic failure reply.
    Error {
        /// Human-readable reason
        message: String,
    },
    /// Instance asks the relay to mint a claim code for it.
    IssueCode {
        /// Requested lifetime; the relay default applies when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
    },
    /// Relay reply to [`RelayMessage::IssueCode`].
    ClaimCode {
        /// The freshly minted code
        code: ClaimCode,
        /// Unix seconds after which the code is dead
        expires_at: i64,
    },
    /// Client redeems a code on its socket.
    ///
    /// The code stays a raw string so malformed input is denied by the
    /// claim store like any other bad code.
    Redeem {
        /// Code as typed by the user
        code: String,
        /// Client static key
        client_public_key: PublicKey,
    },
    /// Relay reply to a successful [`RelayMessage::Redeem`].
    Paired {
        /// Session assigned to this client
        session_id: SessionId,
        /// Key the instance will prove during the handshake
        instance_public_key: PublicKey,
    },
    /// Opaque tunnel bytes for one session.
    Frame {
        /// Owning session
        session_id: SessionId,
        /// Handshake message or ciphertext
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },
    /// Either side is done with a session.
    Close {
        /// Session being torn down
        session_id: SessionId,
    },
}

impl RelayMessage {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Serialization)
    }

    /// Deserialize from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(WireError::Deserialization)
    }

    /// The `type` tag, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered => "registered",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Connection { .. } => "connection",
            Self::Error { .. } => "error",
            Self::IssueCode { .. } => "issue_code",
            Self::ClaimCode { .. } => "claim_code",
            Self::Redeem { .. } => "redeem",
            Self::Paired { .. } => "paired",
            Self::Frame { .. } => "frame",
            Self::Close { .. } => "close",
        }
    }

    /// Shorthand for an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Description of the client device, sent encrypted in the final
/// handshake message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Display name chosen by the user
    pub device_name: String,
    /// Form factor, e.g. `desktop` or `mobile`
    pub device_type: String,
    /// Operating system
    pub device_os: String,
}

impl DeviceInfo {
    /// Serialize for a handshake payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Serialization)
    }

    /// Parse a handshake payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Deserialization)
    }
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
