//! Storage layer for tunnel-relay.
//!
//! Two tables: claim codes and instance registrations. Timestamps are
//! passed in by the caller so expiry follows the injected clock.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use tunnel_types::{InstanceId, PublicKey};

/// A claim code row as inserted.
#[derive(Debug, Clone)]
pub struct NewClaim {
    /// Normalized 8-character code.
    pub code: String,
    /// Instance the code grants access to.
    pub instance_ref: String,
    /// Who asked for the code.
    pub issuer: String,
    /// Unix seconds at issue.
    pub created_at: i64,
    /// Unix seconds after which the code is dead.
    pub expires_at: i64,
}

/// A claim code row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClaim {
    /// Normalized 8-character code.
    pub code: String,
    /// Instance the code grants access to.
    pub instance_ref: String,
    /// Who asked for the code.
    pub issuer: String,
    /// Unix seconds at issue.
    pub created_at: i64,
    /// Unix seconds after which the code is dead.
    pub expires_at: i64,
    /// Set exactly once, by the winning redemption.
    pub consumed_at: Option<i64>,
    /// Identity of the winning redeemer.
    pub consumed_by: Option<String>,
}

/// A registered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Stable instance identifier.
    pub instance_id: InstanceId,
    /// Static key bound at first registration.
    pub public_key: PublicKey,
    /// Candidate endpoints in preference order.
    pub addresses: Vec<String>,
    /// Unix seconds of the last registration or disconnect.
    pub last_seen_at: i64,
    /// Whether a socket is currently registered.
    pub online: bool,
}

/// Claim code persistence.
#[async_trait]
pub trait ClaimStorage: Send + Sync {
    /// Insert a new code.
    ///
    /// Returns `false` if the code collides with a row that is still live
    /// (unexpired, or consumed and not yet swept). An expired unconsumed
    /// row is overwritten.
    async fn insert_code(&self, claim: &NewClaim) -> Result<bool, StorageError>;

    /// Atomically mark `code` consumed if it is unconsumed and unexpired.
    ///
    /// Returns the instance reference for the single winner, `None` for
    /// everyone else.
    async fn consume_code(
        &self,
        code: &str,
        now: i64,
        consumed_by: &str,
    ) -> Result<Option<String>, StorageError>;

    /// Fetch a code regardless of its state.
    async fn lookup_code(&self, code: &str) -> Result<Option<StoredClaim>, StorageError>;

    /// Delete codes past `expires_at`. Returns the number deleted.
    async fn delete_expired(&self, now: i64) -> Result<u64, StorageError>;

    /// Count codes that could still be redeemed.
    async fn count_pending(&self, now: i64) -> Result<u64, StorageError>;
}

/// Instance registration persistence.
#[async_trait]
pub trait InstanceStorage: Send + Sync {
    /// Create or refresh a registration and mark it online.
    ///
    /// Returns `false`, changing nothing, if the id is already bound to a
    /// different public key.
    async fn register_instance(&self, record: &InstanceRecord) -> Result<bool, StorageError>;

    /// Flip the online flag and touch `last_seen_at`.
    async fn set_online(
        &self,
        instance_id: &InstanceId,
        online: bool,
        now: i64,
    ) -> Result<(), StorageError>;

    /// Fetch a registration.
    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, StorageError>;

    /// Mark every registration offline. Run at startup.
    async fn mark_all_offline(&self) -> Result<u64, StorageError>;

    /// Number of registrations currently online.
    async fn count_online(&self) -> Result<u64, StorageError>;
}
