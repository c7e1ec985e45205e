//! Per-connection session management.
//!
//! Each socket gets a session that tracks its state and handles decoded
//! envelopes. Replies go onto the socket's own outbound queue; the caller
//! owns the socket and the writer task.

use crate::claims::Requester;
use crate::error::ProtocolError;
use crate::router::{ConnId, Outbound};
use crate::server::{RegisterError, RelayMetrics, TunnelRelay, RATE_LIMITED};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tunnel_types::{InstanceId, RelayMessage};

/// What the socket loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Close the socket.
    Close,
}

/// Instance socket states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    /// Waiting for `register`.
    AwaitingRegister,
    /// Registered and routable.
    Registered {
        /// The registered id.
        instance_id: InstanceId,
    },
}

/// Session for one `/v1/instance` socket.
pub struct InstanceSession {
    relay: Arc<TunnelRelay>,
    ip: IpAddr,
    tx: Outbound,
    conn: ConnId,
    state: InstanceState,
}

impl InstanceSession {
    /// Create a session for a freshly accepted socket.
    pub fn new(relay: Arc<TunnelRelay>, ip: IpAddr, tx: Outbound) -> Self {
        let conn = relay.router().next_conn_id();
        Self {
            relay,
            ip,
            tx,
            conn,
            state: InstanceState::AwaitingRegister,
        }
    }

    /// Current state.
    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// Whether `register` has succeeded.
    pub fn is_registered(&self) -> bool {
        matches!(self.state, InstanceState::Registered { .. })
    }

    /// Handle one decoded envelope.
    pub async fn handle(&mut self, message: RelayMessage) -> Flow {
        match (self.state.clone(), message) {
            (_, RelayMessage::Ping) => self.reply(RelayMessage::Pong),

            (
                InstanceState::AwaitingRegister,
                RelayMessage::Register {
                    instance_id,
                    public_key,
                    addresses,
                },
            ) => {
                if let Err(e) = self.relay.rate_limits().check_register(self.ip) {
                    RelayMetrics::bump(&self.relay.metrics().rate_limit_hits);
                    tracing::warn!(ip = %self.ip, "Register rejected: {}", e);
                    self.reply(RelayMessage::error(RATE_LIMITED));
                    return Flow::Close;
                }

                match self
                    .relay
                    .register_instance(instance_id, public_key, addresses, self.tx.clone(), self.conn)
                    .await
                {
                    Ok(()) => {
                        self.state = InstanceState::Registered { instance_id };
                        self.reply(RelayMessage::Registered)
                    }
                    Err(RegisterError::Protocol(e)) => {
                        self.fail(&e);
                        Flow::Close
                    }
                    Err(RegisterError::Storage(e)) => {
                        tracing::error!(instance = ?instance_id, "Registration storage failure: {}", e);
                        RelayMetrics::bump(&self.relay.metrics().errors_total);
                        self.reply(RelayMessage::error("internal error"));
                        Flow::Close
                    }
                }
            }

            (InstanceState::AwaitingRegister, other) => {
                tracing::debug!(kind = other.kind(), "Message before register");
                self.fail(&ProtocolError::NotRegistered)
            }

            (InstanceState::Registered { instance_id }, RelayMessage::IssueCode { ttl_secs }) => {
                let issuer = format!("instance:{instance_id}");
                match self
                    .relay
                    .issue_code(&instance_id, &issuer, ttl_secs.map(Duration::from_secs))
                    .await
                {
                    Ok(issued) => self.reply(RelayMessage::ClaimCode {
                        code: issued.code,
                        expires_at: issued.expires_at,
                    }),
                    Err(e) => {
                        tracing::error!(instance = ?instance_id, "Could not issue code: {}", e);
                        RelayMetrics::bump(&self.relay.metrics().errors_total);
                        self.reply(RelayMessage::error("could not issue claim code"))
                    }
                }
            }

            (
                InstanceState::Registered { instance_id },
                RelayMessage::Frame {
                    session_id,
                    payload,
                },
            ) => {
                let len = payload.len();
                match self
                    .relay
                    .router()
                    .from_instance(&instance_id, session_id, payload)
                {
                    Ok(()) => {
                        self.relay.record_frame(len);
                        Flow::Continue
                    }
                    Err(e) => {
                        tracing::debug!(session = ?session_id, "Frame not delivered: {}", e);
                        self.reply(RelayMessage::Close { session_id })
                    }
                }
            }

            (InstanceState::Registered { instance_id }, RelayMessage::Close { session_id }) => {
                self.relay
                    .router()
                    .close_from_instance(&instance_id, session_id);
                Flow::Continue
            }

            (InstanceState::Registered { .. }, other) => self.fail(&ProtocolError::UnexpectedMessage {
                expected: "issue_code, frame, close or ping".to_string(),
                actual: other.kind().to_string(),
            }),
        }
    }

    /// Tear down routing state once the socket is gone.
    pub async fn finish(self) {
        if let InstanceState::Registered { instance_id } = self.state {
            self.relay.unregister_instance(&instance_id, self.conn).await;
        }
    }

    fn reply(&self, message: RelayMessage) -> Flow {
        reply(&self.tx, message)
    }

    fn fail(&self, error: &ProtocolError) -> Flow {
        RelayMetrics::bump(&self.relay.metrics().errors_total);
        tracing::debug!(ip = %self.ip, "Protocol error on instance socket: {}", error);
        self.reply(RelayMessage::error(error.to_string()))
    }
}

/// Session for one `/v1/client` socket.
pub struct ClientSession {
    relay: Arc<TunnelRelay>,
    ip: IpAddr,
    tx: Outbound,
    conn: ConnId,
    paired: bool,
}

impl ClientSession {
    /// Create a session for a freshly accepted socket.
    pub fn new(relay: Arc<TunnelRelay>, ip: IpAddr, tx: Outbound) -> Self {
        let conn = relay.router().next_conn_id();
        Self {
            relay,
            ip,
            tx,
            conn,
            paired: false,
        }
    }

    /// Whether a redemption on this socket has opened a session.
    pub fn is_paired(&self) -> bool {
        self.paired
    }

    /// Handle one decoded envelope.
    pub async fn handle(&mut self, message: RelayMessage) -> Flow {
        match message {
            RelayMessage::Ping => reply(&self.tx, RelayMessage::Pong),

            RelayMessage::Redeem {
                code,
                client_public_key,
            } => {
                let requester = Requester {
                    ip: self.ip,
                    identity: format!("client:{}@{}", client_public_key.to_base64(), self.ip),
                };
                let answer = self
                    .relay
                    .pair(&code, client_public_key, &requester, self.tx.clone(), self.conn)
                    .await;
                self.paired |= matches!(answer, RelayMessage::Paired { .. });
                reply(&self.tx, answer)
            }

            RelayMessage::Frame {
                session_id,
                payload,
            } => {
                let len = payload.len();
                match self.relay.router().from_client(self.conn, session_id, payload) {
                    Ok(()) => {
                        self.relay.record_frame(len);
                        Flow::Continue
                    }
                    Err(e) => {
                        tracing::debug!(session = ?session_id, "Frame not delivered: {}", e);
                        reply(&self.tx, RelayMessage::Close { session_id })
                    }
                }
            }

            RelayMessage::Close { session_id } => {
                self.relay.router().close_from_client(self.conn, session_id);
                Flow::Continue
            }

            other => {
                RelayMetrics::bump(&self.relay.metrics().errors_total);
                let error = ProtocolError::UnexpectedMessage {
                    expected: "redeem, frame, close or ping".to_string(),
                    actual: other.kind().to_string(),
                };
                reply(&self.tx, RelayMessage::error(error.to_string()))
            }
        }
    }

    /// Close every session this socket owned.
    pub async fn finish(self) {
        let closed = self.relay.router().detach_client(self.conn);
        if closed > 0 {
            tracing::debug!(ip = %self.ip, closed, "Client socket gone");
        }
    }
}

/// Queue a reply; a full or closed queue ends the socket.
fn reply(tx: &Outbound, message: RelayMessage) -> Flow {
    match tx.try_send(message) {
        Ok(()) => Flow::Continue,
        Err(e) => {
            tracing::warn!("Outbound queue unavailable: {}", e);
            Flow::Close
        }
    }
}
