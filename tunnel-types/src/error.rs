//! Error types for 0k-Tunnel wire handling.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire types.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Claim code has the wrong length or contains symbols outside the alphabet
    #[error("invalid claim code")]
    InvalidClaimCode,

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::InvalidData("bad key".into());
        assert_eq!(err.to_string(), "invalid data: bad key");
        assert_eq!(WireError::InvalidClaimCode.to_string(), "invalid claim code");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
