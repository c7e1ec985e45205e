//! Main TunnelRelay server coordination.
//!
//! TunnelRelay ties together storage, the claim code store, rate limits
//! and the session router. Socket handlers and HTTP handlers share one
//! `Arc<TunnelRelay>`.

use crate::claims::{ClaimCodeStore, IssuedCode, RedeemOutcome, Requester};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ClaimError, ProtocolError, StorageError};
use crate::limits::RateLimits;
use crate::router::{ConnId, Outbound, RelayMessageRouter};
use crate::storage::{InstanceRecord, InstanceStorage, SqliteStorage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tunnel_types::{InstanceId, PublicKey, RelayMessage};

pub use tunnel_types::{DENIED, RATE_LIMITED};

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Successful instance registrations.
    pub registrations_total: AtomicU64,
    /// Claim codes issued.
    pub codes_issued_total: AtomicU64,
    /// Redemptions that won a code.
    pub redemptions_granted_total: AtomicU64,
    /// Redemptions refused.
    pub redemptions_denied_total: AtomicU64,
    /// Rate limit rejections (redeem + register + global).
    pub rate_limit_hits: AtomicU64,
    /// Sessions handed to an instance.
    pub sessions_opened_total: AtomicU64,
    /// Frames forwarded in either direction.
    pub frames_relayed_total: AtomicU64,
    /// Opaque payload bytes forwarded.
    pub bytes_relayed_total: AtomicU64,
    /// Protocol errors (bad envelopes, unknown sessions, etc.).
    pub errors_total: AtomicU64,
}

impl RelayMetrics {
    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Main relay server.
pub struct TunnelRelay {
    config: Config,
    storage: Arc<SqliteStorage>,
    clock: Arc<dyn Clock>,
    claims: ClaimCodeStore,
    rate_limits: RateLimits,
    router: RelayMessageRouter,
    metrics: RelayMetrics,
}

impl std::fmt::Debug for TunnelRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("instances_online", &self.router.instance_count())
            .field("sessions", &self.router.session_count())
            .finish_non_exhaustive()
    }
}

impl TunnelRelay {
    /// Create a relay on the system clock.
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        Self::with_clock(config, storage, Arc::new(SystemClock))
    }

    /// Create a relay with an explicit clock.
    pub fn with_clock(config: Config, storage: SqliteStorage, clock: Arc<dyn Clock>) -> Self {
        let storage = Arc::new(storage);
        let rate_limits = RateLimits::new(&config.limits);
        let claims = ClaimCodeStore::new(
            storage.clone(),
            clock.clone(),
            rate_limits.clone(),
            config.pairing.clone(),
        );
        let router =
            RelayMessageRouter::new(config.server.max_sessions, config.limits.max_frame_size);

        Self {
            config,
            storage,
            clock,
            claims,
            rate_limits,
            router,
            metrics: RelayMetrics::default(),
        }
    }

    /// Reset registrations left online by a previous run.
    pub async fn startup(&self) -> Result<(), StorageError> {
        let stale = self.storage.mark_all_offline().await?;
        if stale > 0 {
            tracing::info!("Marked {} stale registrations offline", stale);
        }
        Ok(())
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Get the claim code store.
    pub fn claims(&self) -> &ClaimCodeStore {
        &self.claims
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get the session router.
    pub fn router(&self) -> &RelayMessageRouter {
        &self.router
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Current unix time per the relay clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Record a registration and make the instance routable.
    ///
    /// Fails with `KeyMismatch` if the id is bound to another key.
    pub async fn register_instance(
        &self,
        instance_id: InstanceId,
        public_key: PublicKey,
        addresses: Vec<String>,
        tx: Outbound,
        conn: ConnId,
    ) -> Result<(), RegisterError> {
        let record = InstanceRecord {
            instance_id,
            public_key,
            addresses,
            last_seen_at: self.now(),
            online: true,
        };
        if !self.storage.register_instance(&record).await? {
            tracing::warn!(instance = ?instance_id, key = ?public_key, "Registration with foreign key refused");
            return Err(ProtocolError::KeyMismatch(instance_id).into());
        }

        self.router.attach_instance(instance_id, public_key, tx, conn);
        RelayMetrics::bump(&self.metrics.registrations_total);
        tracing::info!(instance = ?instance_id, key = ?public_key, "Instance registered");
        Ok(())
    }

    /// Drop an instance socket and mark it offline if it was current.
    pub async fn unregister_instance(&self, instance_id: &InstanceId, conn: ConnId) {
        if !self.router.detach_instance(instance_id, conn) {
            return;
        }
        if let Err(e) = self
            .storage
            .set_online(instance_id, false, self.now())
            .await
        {
            tracing::error!(instance = ?instance_id, "Failed to mark instance offline: {}", e);
        }
        tracing::info!(instance = ?instance_id, "Instance offline");
    }

    /// Issue a code for a known instance.
    pub async fn issue_code(
        &self,
        instance_id: &InstanceId,
        issuer: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedCode, ClaimError> {
        if self.storage.get_instance(instance_id).await?.is_none() {
            return Err(ClaimError::UnknownInstance(*instance_id));
        }
        let issued = self.claims.generate_code(instance_id, issuer, ttl).await?;
        RelayMetrics::bump(&self.metrics.codes_issued_total);
        Ok(issued)
    }

    /// Redeem a code and count the outcome.
    pub async fn redeem(&self, code: &str, requester: &Requester) -> RedeemOutcome {
        let outcome = self.claims.redeem(code, requester).await;
        let counter = match &outcome {
            RedeemOutcome::Granted { .. } => &self.metrics.redemptions_granted_total,
            RedeemOutcome::Denied => &self.metrics.redemptions_denied_total,
            RedeemOutcome::RateLimited => &self.metrics.rate_limit_hits,
        };
        RelayMetrics::bump(counter);
        outcome
    }

    /// Redeem on a client socket and open the session.
    ///
    /// Returns the reply for the client: `paired` or `error`.
    pub async fn pair(
        &self,
        code: &str,
        client_public_key: PublicKey,
        requester: &Requester,
        client_tx: Outbound,
        client_conn: ConnId,
    ) -> RelayMessage {
        let instance_ref = match self.redeem(code, requester).await {
            RedeemOutcome::Granted { instance_ref } => instance_ref,
            RedeemOutcome::Denied => return RelayMessage::error(DENIED),
            RedeemOutcome::RateLimited => return RelayMessage::error(RATE_LIMITED),
        };

        match self
            .router
            .open_session(instance_ref, client_public_key, client_tx, client_conn)
        {
            Ok((session_id, instance_public_key)) => {
                RelayMetrics::bump(&self.metrics.sessions_opened_total);
                RelayMessage::Paired {
                    session_id,
                    instance_public_key,
                }
            }
            Err(e) => {
                tracing::info!(instance = ?instance_ref, "Redeemed but not routable: {}", e);
                RelayMessage::error(e.to_string())
            }
        }
    }

    /// Count a forwarded frame.
    pub fn record_frame(&self, len: usize) {
        RelayMetrics::bump(&self.metrics.frames_relayed_total);
        self.metrics
            .bytes_relayed_total
            .fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// Registration failures.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// Refused by protocol rules.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.pairing.denial_floor_ms = 0;
        config
    }

    async fn relay() -> TunnelRelay {
        let storage = SqliteStorage::in_memory().await.unwrap();
        TunnelRelay::with_clock(
            test_config(),
            storage,
            Arc::new(ManualClock::new(1_700_000_000)),
        )
    }

    fn requester() -> Requester {
        Requester {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            identity: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn register_then_pair() {
        let relay = relay().await;
        let id = InstanceId::new();
        let (itx, mut irx) = mpsc::channel(8);
        relay
            .register_instance(id, PublicKey::new([1; 32]), vec![], itx, 1)
            .await
            .unwrap();

        let issued = relay.issue_code(&id, "owner", None).await.unwrap();
        let (ctx, _crx) = mpsc::channel(8);
        let reply = relay
            .pair(issued.code.as_str(), PublicKey::new([2; 32]), &requester(), ctx, 2)
            .await;

        let RelayMessage::Paired {
            session_id,
            instance_public_key,
        } = reply
        else {
            panic!("expected paired, got {reply:?}");
        };
        assert_eq!(instance_public_key, PublicKey::new([1; 32]));
        assert_eq!(
            irx.try_recv().unwrap(),
            RelayMessage::Connection {
                session_id,
                client_public_key: PublicKey::new([2; 32])
            }
        );
        assert_eq!(
            relay.metrics().redemptions_granted_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_pairs_open_one_session() {
        let relay = Arc::new(relay().await);
        let id = InstanceId::new();
        let (itx, mut irx) = mpsc::channel(32);
        relay
            .register_instance(id, PublicKey::new([1; 32]), vec![], itx, 1)
            .await
            .unwrap();
        let issued = relay.issue_code(&id, "owner", None).await.unwrap();

        let mut clients = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..10u8 {
            let relay = relay.clone();
            let code = issued.code.to_string();
            let (ctx, crx) = mpsc::channel(8);
            clients.push(crx);
            // Separate addresses so the per-IP redeem limit stays out of the way
            let requester = Requester {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i + 1)),
                identity: format!("client-{i}"),
            };
            tasks.push(tokio::spawn(async move {
                relay
                    .pair(&code, PublicKey::new([i + 2; 32]), &requester, ctx, u64::from(i) + 2)
                    .await
            }));
        }

        let mut replies = Vec::new();
        for task in tasks {
            replies.push(task.await.unwrap());
        }
        let paired = replies
            .iter()
            .filter(|r| matches!(r, RelayMessage::Paired { .. }))
            .count();
        assert_eq!(paired, 1);
        assert!(replies
            .iter()
            .filter(|r| !matches!(r, RelayMessage::Paired { .. }))
            .all(|r| *r == RelayMessage::error(DENIED)));

        let mut connections = 0;
        while let Ok(message) = irx.try_recv() {
            assert!(matches!(message, RelayMessage::Connection { .. }));
            connections += 1;
        }
        assert_eq!(connections, 1);
        assert_eq!(relay.router().session_count(), 1);
    }

    #[tokio::test]
    async fn pair_with_offline_instance_consumes_code() {
        let relay = relay().await;
        let id = InstanceId::new();
        let (itx, _irx) = mpsc::channel(8);
        relay
            .register_instance(id, PublicKey::new([1; 32]), vec![], itx, 1)
            .await
            .unwrap();
        let issued = relay.issue_code(&id, "owner", None).await.unwrap();
        relay.unregister_instance(&id, 1).await;

        let (ctx, _crx) = mpsc::channel(8);
        let reply = relay
            .pair(issued.code.as_str(), PublicKey::new([2; 32]), &requester(), ctx.clone(), 2)
            .await;
        assert_eq!(reply, RelayMessage::error("connection unavailable"));

        let again = relay
            .pair(issued.code.as_str(), PublicKey::new([2; 32]), &requester(), ctx, 2)
            .await;
        assert_eq!(again, RelayMessage::error(DENIED));
    }

    #[tokio::test]
    async fn bad_codes_get_uniform_reply() {
        let relay = relay().await;
        let (ctx, _crx) = mpsc::channel(8);
        for code in ["", "ABCD2345", "!!!"] {
            let reply = relay
                .pair(code, PublicKey::new([2; 32]), &requester(), ctx.clone(), 2)
                .await;
            assert_eq!(reply, RelayMessage::error(DENIED));
        }
    }

    #[tokio::test]
    async fn foreign_key_registration_is_refused() {
        let relay = relay().await;
        let id = InstanceId::new();
        let (tx, _rx) = mpsc::channel(8);
        relay
            .register_instance(id, PublicKey::new([1; 32]), vec![], tx.clone(), 1)
            .await
            .unwrap();

        let err = relay
            .register_instance(id, PublicKey::new([9; 32]), vec![], tx, 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegisterError::Protocol(ProtocolError::KeyMismatch(_))
        ));
        assert_eq!(relay.router().online_key(&id), Some(PublicKey::new([1; 32])));
    }

    #[tokio::test]
    async fn issue_code_requires_known_instance() {
        let relay = relay().await;
        let err = relay
            .issue_code(&InstanceId::new(), "owner", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn startup_marks_everything_offline() {
        let relay = relay().await;
        let id = InstanceId::new();
        let (tx, _rx) = mpsc::channel(8);
        relay
            .register_instance(id, PublicKey::new([1; 32]), vec![], tx, 1)
            .await
            .unwrap();
        relay.startup().await.unwrap();
        let record = relay.storage().get_instance(&id).await.unwrap().unwrap();
        assert!(!record.online);
    }
}
