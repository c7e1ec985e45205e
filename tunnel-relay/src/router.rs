//! Session routing between client and instance sockets.
//!
//! The router only sees envelopes. Frame payloads are forwarded untouched
//! and never stored; the only keys it holds are public ones.
//!
//! Every socket owns an outbound queue drained by a single writer task.
//! The router pushes with `try_send`, so a stuck peer fails its own
//! sessions instead of stalling anyone else.

use crate::error::{ProtocolError, ProtocolResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tunnel_types::{InstanceId, PublicKey, RelayMessage, SessionId};

/// Outbound queue of one socket.
pub type Outbound = mpsc::Sender<RelayMessage>;

/// Identifies one accepted socket.
pub type ConnId = u64;

/// Lifecycle of a relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created on redemption; instance has not spoken yet.
    Pending,
    /// Instance answered; frames flow both ways.
    Active,
    /// Torn down. Never stored, only reported.
    Closed,
}

/// Which end of a session something came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The redeeming client.
    Client,
    /// The registered instance.
    Instance,
}

/// Routing entry for one session.
#[derive(Debug, Clone)]
pub struct RelaySession {
    /// Session identifier.
    pub session_id: SessionId,
    /// Key the client presented at redemption.
    pub client_public_key: PublicKey,
    /// Instance the session was routed to.
    pub instance_ref: InstanceId,
    /// Current state.
    pub state: SessionState,
    client_tx: Outbound,
    client_conn: ConnId,
    instance_conn: ConnId,
}

#[derive(Debug, Clone)]
struct InstanceLink {
    tx: Outbound,
    public_key: PublicKey,
    conn: ConnId,
}

/// Routes frames between sockets.
#[derive(Debug)]
pub struct RelayMessageRouter {
    instances: DashMap<InstanceId, InstanceLink>,
    sessions: DashMap<SessionId, RelaySession>,
    // Slots taken against `max_sessions`, reserved before insert.
    reserved: AtomicUsize,
    next_conn: AtomicU64,
    max_sessions: usize,
    max_frame_size: usize,
}

impl RelayMessageRouter {
    /// Create a router with the given bounds.
    pub fn new(max_sessions: usize, max_frame_size: usize) -> Self {
        Self {
            instances: DashMap::new(),
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            next_conn: AtomicU64::new(1),
            max_sessions,
            max_frame_size,
        }
    }

    /// Allocate an id for a newly accepted socket.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    // ===========================================
    // Instances
    // ===========================================

    /// Make `instance_id` reachable through `tx`.
    ///
    /// A newer socket replaces an older one; sessions riding the old
    /// socket are closed.
    pub fn attach_instance(
        &self,
        instance_id: InstanceId,
        public_key: PublicKey,
        tx: Outbound,
        conn: ConnId,
    ) {
        let previous = self
            .instances
            .insert(instance_id, InstanceLink { tx, public_key, conn });

        if let Some(old) = previous {
            tracing::info!(instance = ?instance_id, "Instance socket replaced");
            self.close_where(|s| s.instance_ref == instance_id && s.instance_conn == old.conn);
        }
    }

    /// Forget the socket `conn` of `instance_id` and close its sessions.
    ///
    /// Ignored if a newer socket has taken over.
    pub fn detach_instance(&self, instance_id: &InstanceId, conn: ConnId) -> bool {
        let removed = self
            .instances
            .remove_if(instance_id, |_, link| link.conn == conn)
            .is_some();

        if removed {
            self.close_where(|s| s.instance_ref == *instance_id && s.instance_conn == conn);
        }
        removed
    }

    /// Public key of an online instance.
    pub fn online_key(&self, instance_id: &InstanceId) -> Option<PublicKey> {
        self.instances.get(instance_id).map(|link| link.public_key)
    }

    // ===========================================
    // Sessions
    // ===========================================

    /// Open a session to `instance_id` for a client that just redeemed.
    ///
    /// Sends `connection` to the instance and returns the new session id
    /// with the instance's public key for the `paired` reply.
    pub fn open_session(
        &self,
        instance_id: InstanceId,
        client_public_key: PublicKey,
        client_tx: Outbound,
        client_conn: ConnId,
    ) -> ProtocolResult<(SessionId, PublicKey)> {
        let max = self.max_sessions;
        if self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            tracing::warn!(limit = max, "Session table full");
            return Err(ProtocolError::TooManySessions { limit: max });
        }

        let Some(link) = self.instances.get(&instance_id).map(|l| l.clone()) else {
            self.release_slot();
            return Err(ProtocolError::Unavailable);
        };

        let session_id = SessionId::new();
        self.sessions.insert(
            session_id,
            RelaySession {
                session_id,
                client_public_key,
                instance_ref: instance_id,
                state: SessionState::Pending,
                client_tx,
                client_conn,
                instance_conn: link.conn,
            },
        );

        let announce = RelayMessage::Connection {
            session_id,
            client_public_key,
        };
        if link.tx.try_send(announce).is_err() {
            self.sessions.remove(&session_id);
            self.release_slot();
            tracing::warn!(instance = ?instance_id, "Instance queue unavailable, session dropped");
            return Err(ProtocolError::Unavailable);
        }

        tracing::info!(session = ?session_id, instance = ?instance_id, "Session opened");
        Ok((session_id, link.public_key))
    }

    /// Forward a frame the client on `client_conn` sent.
    pub fn from_client(
        &self,
        client_conn: ConnId,
        session_id: SessionId,
        payload: Vec<u8>,
    ) -> ProtocolResult<()> {
        let (instance_ref, instance_conn) = self
            .sessions
            .get(&session_id)
            .filter(|s| s.client_conn == client_conn)
            .map(|s| (s.instance_ref, s.instance_conn))
            .ok_or(ProtocolError::UnknownSession(session_id))?;
        let instance_tx = self
            .instances
            .get(&instance_ref)
            .filter(|l| l.conn == instance_conn)
            .map(|l| l.tx.clone());

        self.forward(session_id, Side::Client, instance_tx, payload)
    }

    /// Forward a frame the instance sent.
    ///
    /// The first frame from the instance activates the session.
    pub fn from_instance(
        &self,
        instance_id: &InstanceId,
        session_id: SessionId,
        payload: Vec<u8>,
    ) -> ProtocolResult<()> {
        let client_tx = {
            let mut session = self
                .sessions
                .get_mut(&session_id)
                .filter(|s| s.instance_ref == *instance_id)
                .ok_or(ProtocolError::UnknownSession(session_id))?;
            if session.state == SessionState::Pending {
                session.state = SessionState::Active;
                tracing::debug!(session = ?session_id, "Session active");
            }
            Some(session.client_tx.clone())
        };

        self.forward(session_id, Side::Instance, client_tx, payload)
    }

    fn forward(
        &self,
        session_id: SessionId,
        from: Side,
        to: Option<Outbound>,
        payload: Vec<u8>,
    ) -> ProtocolResult<()> {
        if payload.len() > self.max_frame_size {
            tracing::warn!(
                session = ?session_id,
                size = payload.len(),
                "Oversize frame, closing session"
            );
            self.close_session(session_id, from);
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        }

        let Some(to) = to else {
            self.close_session(session_id, from);
            return Err(ProtocolError::Unavailable);
        };

        tracing::trace!(session = ?session_id, ?from, len = payload.len(), "Frame");
        if to
            .try_send(RelayMessage::Frame {
                session_id,
                payload,
            })
            .is_err()
        {
            tracing::warn!(session = ?session_id, "Peer queue full or gone, closing session");
            self.close_session(session_id, from);
            return Err(ProtocolError::Unavailable);
        }
        Ok(())
    }

    /// Close a session on request of `from`, telling the other side.
    ///
    /// Returns `false` if the session did not exist.
    pub fn close_session(&self, session_id: SessionId, from: Side) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        self.release_slot();

        let close = RelayMessage::Close { session_id };
        let notify_client = from != Side::Client;
        let notify_instance = from != Side::Instance;

        if notify_client {
            let _ = session.client_tx.try_send(close.clone());
        }
        if notify_instance {
            if let Some(link) = self.instances.get(&session.instance_ref) {
                if link.conn == session.instance_conn {
                    let _ = link.tx.try_send(close);
                }
            }
        }

        tracing::info!(session = ?session_id, ?from, "Session closed");
        true
    }

    /// Close a session only if `client_conn` owns it.
    pub fn close_from_client(&self, client_conn: ConnId, session_id: SessionId) -> bool {
        let owned = self
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.client_conn == client_conn);
        owned && self.close_session(session_id, Side::Client)
    }

    /// Close a session only if `instance_id` owns it.
    pub fn close_from_instance(&self, instance_id: &InstanceId, session_id: SessionId) -> bool {
        let owned = self
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.instance_ref == *instance_id);
        owned && self.close_session(session_id, Side::Instance)
    }

    /// Close every session of a departing client socket.
    pub fn detach_client(&self, client_conn: ConnId) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.client_conn == client_conn)
            .map(|s| s.session_id)
            .collect();
        ids.iter()
            .filter(|id| self.close_session(**id, Side::Client))
            .count()
    }

    fn release_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    fn close_where(&self, pred: impl Fn(&RelaySession) -> bool) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| pred(s.value()))
            .map(|s| s.session_id)
            .collect();
        ids.iter()
            .filter(|id| self.close_session(**id, Side::Instance))
            .count()
    }

    /// State of a session, `Closed` if it no longer exists.
    pub fn session_state(&self, session_id: &SessionId) -> SessionState {
        self.sessions
            .get(session_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Closed)
    }

    /// Snapshot of a session's routing entry.
    pub fn session(&self, session_id: &SessionId) -> Option<RelaySession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Number of routed sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of online instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}
