//! Error types for tunnel-relay.

use std::path::PathBuf;
use tunnel_types::{InstanceId, SessionId, WireError};

/// Main error type for tunnel-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Claim code error.
    #[error("claim error: {0}")]
    Claim(#[from] ClaimError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row does not decode.
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow {
        /// Table the row came from.
        table: &'static str,
        /// What failed to decode.
        reason: String,
    },

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Claim code failures.
///
/// Callers outside the relay only ever see `RateLimited` or a uniform
/// denial; the other reasons exist for logging.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    /// No such code.
    #[error("claim code not found")]
    NotFound,

    /// Code exists but its TTL has passed.
    #[error("claim code expired")]
    Expired,

    /// Code was already redeemed.
    #[error("claim code already consumed")]
    AlreadyConsumed,

    /// Input is not a well-formed code.
    #[error("malformed claim code")]
    Malformed,

    /// Caller exceeded its redemption quota.
    #[error("too many redemption attempts")]
    RateLimited,

    /// Every drawn code collided with a live one.
    #[error("no free claim code after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The instance the code would point at is not registered.
    #[error("unknown instance: {0:?}")]
    UnknownInstance(InstanceId),

    /// Backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ClaimError {
    /// Short label for log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyConsumed => "already_consumed",
            Self::Malformed => "malformed",
            Self::RateLimited => "rate_limited",
            Self::Exhausted { .. } => "exhausted",
            Self::UnknownInstance(_) => "unknown_instance",
            Self::Storage(_) => "storage",
        }
    }
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Envelope did not decode.
    #[error("invalid message: {0}")]
    Wire(#[from] WireError),

    /// Unexpected message type.
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: String,
        /// Actual message type received.
        actual: String,
    },

    /// Instance socket sent traffic before `register`.
    #[error("instance not registered: register required first")]
    NotRegistered,

    /// Instance id is already bound to another key.
    #[error("instance {0:?} is bound to a different public key")]
    KeyMismatch(InstanceId),

    /// Frame for a session this socket does not own.
    #[error("unknown session: {0:?}")]
    UnknownSession(SessionId),

    /// Frame exceeds the configured limit.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Session table is full.
    #[error("session limit reached ({limit})")]
    TooManySessions {
        /// Configured limit.
        limit: usize,
    },

    /// Peer socket is gone or its queue is full.
    #[error("connection unavailable")]
    Unavailable,

    /// Peer did not speak in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
