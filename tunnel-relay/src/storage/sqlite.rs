//! SQLite storage backend for tunnel-relay.

use super::{ClaimStorage, InstanceRecord, InstanceStorage, NewClaim, StoredClaim};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tunnel_types::{InstanceId, PublicKey};

/// SQLite-based claim and registration storage.
///
/// Uses WAL mode for concurrent reads/writes. Every state change is a
/// single statement, so concurrent callers never interleave.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("connections", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS claim_codes (
                code TEXT PRIMARY KEY,
                instance_ref TEXT NOT NULL,
                issuer TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                consumed_at INTEGER,
                consumed_by TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                public_key BLOB NOT NULL,
                addresses TEXT NOT NULL DEFAULT '[]',
                last_seen_at INTEGER NOT NULL,
                online INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_claim_codes_expires ON claim_codes(expires_at)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }
}

#[async_trait]
impl ClaimStorage for SqliteStorage {
    async fn insert_code(&self, claim: &NewClaim) -> Result<bool, StorageError> {
        // Upsert only over a row that is both expired and never consumed
        let result = sqlx::query(
            r#"
            INSERT INTO claim_codes (code, instance_ref, issuer, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(code) DO UPDATE SET
                instance_ref = excluded.instance_ref,
                issuer = excluded.issuer,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            WHERE claim_codes.expires_at <= excluded.created_at
              AND claim_codes.consumed_at IS NULL
            "#,
        )
        .bind(&claim.code)
        .bind(&claim.instance_ref)
        .bind(&claim.issuer)
        .bind(claim.created_at)
        .bind(claim.expires_at)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn consume_code(
        &self,
        code: &str,
        now: i64,
        consumed_by: &str,
    ) -> Result<Option<String>, StorageError> {
        let instance_ref: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE claim_codes
            SET consumed_at = ?2, consumed_by = ?3
            WHERE code = ?1 AND consumed_at IS NULL AND expires_at > ?2
            RETURNING instance_ref
            "#,
        )
        .bind(code)
        .bind(now)
        .bind(consumed_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(instance_ref)
    }

    async fn lookup_code(&self, code: &str) -> Result<Option<StoredClaim>, StorageError> {
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT code, instance_ref, issuer, created_at, expires_at, consumed_at, consumed_by
            FROM claim_codes
            WHERE code = ?1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(row.map(StoredClaim::from))
    }

    async fn delete_expired(&self, now: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM claim_codes WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_pending(&self, now: i64) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM claim_codes WHERE consumed_at IS NULL AND expires_at > ?1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(count as u64)
    }
}

#[async_trait]
impl InstanceStorage for SqliteStorage {
    async fn register_instance(&self, record: &InstanceRecord) -> Result<bool, StorageError> {
        let addresses =
            serde_json::to_string(&record.addresses).map_err(|e| StorageError::CorruptRow {
                table: "instances",
                reason: e.to_string(),
            })?;

        let result = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, public_key, addresses, last_seen_at, online)
            VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT(instance_id) DO UPDATE SET
                addresses = excluded.addresses,
                last_seen_at = excluded.last_seen_at,
                online = 1
            WHERE instances.public_key = excluded.public_key
            "#,
        )
        .bind(record.instance_id.to_string())
        .bind(record.public_key.as_bytes().as_slice())
        .bind(addresses)
        .bind(record.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_online(
        &self,
        instance_id: &InstanceId,
        online: bool,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE instances SET online = ?2, last_seen_at = ?3 WHERE instance_id = ?1")
            .bind(instance_id.to_string())
            .bind(online)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, StorageError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT instance_id, public_key, addresses, last_seen_at, online
            FROM instances
            WHERE instance_id = ?1
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        match row {
            Some(r) => Ok(Some(r.try_into()?)),
            None => Ok(None),
        }
    }

    async fn mark_all_offline(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("UPDATE instances SET online = 0 WHERE online = 1")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_online(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE online = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;

        Ok(count as u64)
    }
}

/// Internal row type for claim code queries.
#[derive(sqlx::FromRow)]
struct ClaimRow {
    code: String,
    instance_ref: String,
    issuer: String,
    created_at: i64,
    expires_at: i64,
    consumed_at: Option<i64>,
    consumed_by: Option<String>,
}

impl From<ClaimRow> for StoredClaim {
    fn from(row: ClaimRow) -> Self {
        StoredClaim {
            code: row.code,
            instance_ref: row.instance_ref,
            issuer: row.issuer,
            created_at: row.created_at,
            expires_at: row.expires_at,
            consumed_at: row.consumed_at,
            consumed_by: row.consumed_by,
        }
    }
}

/// Internal row type for instance queries.
#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    public_key: Vec<u8>,
    addresses: String,
    last_seen_at: i64,
    online: bool,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = StorageError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::CorruptRow {
            table: "instances",
            reason,
        };

        Ok(InstanceRecord {
            instance_id: InstanceId::from_str(&row.instance_id)
                .map_err(|e| corrupt(e.to_string()))?,
            public_key: PublicKey::from_bytes(&row.public_key)
                .ok_or_else(|| corrupt(format!("public key is {} bytes", row.public_key.len())))?,
            addresses: serde_json::from_str(&row.addresses).map_err(|e| corrupt(e.to_string()))?,
            last_seen_at: row.last_seen_at,
            online: row.online,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn claim(code: &str, created_at: i64) -> NewClaim {
        NewClaim {
            code: code.to_string(),
            instance_ref: "instance-a".to_string(),
            issuer: "owner".to_string(),
            created_at,
            expires_at: created_at + 300,
        }
    }

    fn record(instance_id: InstanceId, key: u8) -> InstanceRecord {
        InstanceRecord {
            instance_id,
            public_key: PublicKey::new([key; 32]),
            addresses: vec!["192.168.1.10:8096".to_string()],
            last_seen_at: NOW,
            online: true,
        }
    }

    // ===========================================
    // Claim codes
    // ===========================================

    #[tokio::test]
    async fn insert_and_lookup_code() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.insert_code(&claim("ABCD2345", NOW)).await.unwrap());

        let stored = storage.lookup_code("ABCD2345").await.unwrap().unwrap();
        assert_eq!(stored.instance_ref, "instance-a");
        assert_eq!(stored.expires_at, NOW + 300);
        assert_eq!(stored.consumed_at, None);

        assert!(storage.lookup_code("ZZZZ9999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_code_collision_is_refused() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.insert_code(&claim("ABCD2345", NOW)).await.unwrap());
        assert!(!storage.insert_code(&claim("ABCD2345", NOW + 10)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_unswept_code_may_be_reissued() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.insert_code(&claim("ABCD2345", NOW)).await.unwrap());

        let later = NOW + 301;
        let mut fresh = claim("ABCD2345", later);
        fresh.instance_ref = "instance-b".to_string();
        assert!(storage.insert_code(&fresh).await.unwrap());

        let stored = storage.lookup_code("ABCD2345").await.unwrap().unwrap();
        assert_eq!(stored.instance_ref, "instance-b");
        assert_eq!(stored.created_at, later);
    }

    #[tokio::test]
    async fn consumed_code_is_never_reissued() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.insert_code(&claim("ABCD2345", NOW)).await.unwrap();
        storage.consume_code("ABCD2345", NOW + 1, "client").await.unwrap();

        assert!(!storage.insert_code(&claim("ABCD2345", NOW + 1000)).await.unwrap());
        let stored = storage.lookup_code("ABCD2345").await.unwrap().unwrap();
        assert_eq!(stored.consumed_at, Some(NOW + 1));
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.insert_code(&claim("ABCD2345", NOW)).await.unwrap();

        let first = storage.consume_code("ABCD2345", NOW + 5, "c1").await.unwrap();
        assert_eq!(first.as_deref(), Some("instance-a"));

        let second = storage.consume_code("ABCD2345", NOW + 6, "c2").await.unwrap();
        assert!(second.is_none());

        let stored = storage.lookup_code("ABCD2345").await.unwrap().unwrap();
        assert_eq!(stored.consumed_at, Some(NOW + 5));
        assert_eq!(stored.consumed_by.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn consume_rejects_expired_code() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.insert_code(&claim("ABCD2345", NOW)).await.unwrap();

        // expires_at itself is already too late
        let result = storage.consume_code("ABCD2345", NOW + 300, "c").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn concurrent_consume_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(&dir.path().join("relay.db")).await.unwrap();
        storage.insert_code(&claim("RACE2345", NOW)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .consume_code("RACE2345", NOW + 1, &format!("client-{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn delete_expired_and_count_pending() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.insert_code(&claim("OLD22345", NOW - 1000)).await.unwrap();
        storage.insert_code(&claim("NEW22345", NOW)).await.unwrap();
        storage.insert_code(&claim("USED2345", NOW)).await.unwrap();
        storage.consume_code("USED2345", NOW, "c").await.unwrap();

        assert_eq!(storage.count_pending(NOW).await.unwrap(), 1);
        assert_eq!(storage.delete_expired(NOW).await.unwrap(), 1);
        assert!(storage.lookup_code("OLD22345").await.unwrap().is_none());
        assert!(storage.lookup_code("NEW22345").await.unwrap().is_some());
    }

    // ===========================================
    // Instances
    // ===========================================

    #[tokio::test]
    async fn register_and_fetch_instance() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let id = InstanceId::new();

        assert!(storage.register_instance(&record(id, 7)).await.unwrap());
        let fetched = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(fetched, record(id, 7));
        assert_eq!(storage.count_online().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn registration_is_bound_to_first_key() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let id = InstanceId::new();

        assert!(storage.register_instance(&record(id, 7)).await.unwrap());
        assert!(storage.register_instance(&record(id, 7)).await.unwrap());
        assert!(!storage.register_instance(&record(id, 8)).await.unwrap());

        let fetched = storage.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(fetched.public_key, PublicKey::new([7; 32]));
    }

    #[tokio::test]
    async fn online_flag_tracks_sockets() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let a = InstanceId::new();
        let b = InstanceId::new();
        storage.register_instance(&record(a, 1)).await.unwrap();
        storage.register_instance(&record(b, 2)).await.unwrap();

        storage.set_online(&a, false, NOW + 60).await.unwrap();
        let fetched = storage.get_instance(&a).await.unwrap().unwrap();
        assert!(!fetched.online);
        assert_eq!(fetched.last_seen_at, NOW + 60);

        assert_eq!(storage.mark_all_offline().await.unwrap(), 1);
        assert_eq!(storage.count_online().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_instance_is_none() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.get_instance(&InstanceId::new()).await.unwrap().is_none());
    }
}
