//! TunnelClient - the client side of pairing.
//!
//! A client opens a socket to the relay's client endpoint, redeems a
//! claim code, and runs the Noise handshake as initiator against the
//! instance key the relay hands back. The handshake pins that key, so a
//! relay that swaps keys is caught by the handshake, not trusted.
//!
//! ```text
//! client ──redeem──► relay ──connection──► instance
//!        ◄─paired───
//!        ◄══════ Noise XX over frames ══════►
//! ```
//!
//! # Example
//!
//! ```ignore
//! let client = TunnelClient::new(WsTransport::new(), "ws://relay:8080/v1/client");
//! let mut tunnel = client.pair("ABCD2345", Keypair::generate(), &device).await?;
//! tunnel.send(b"hello").await?;
//! ```

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use zerok_tunnel_core::{Keypair, NoiseSession, Role};
use zerok_tunnel_types::{DeviceInfo, RelayMessage, SessionId, DENIED, RATE_LIMITED};

use crate::transport::{Connection, RelayStream, Transport, TransportError};
use crate::tunnel::{establish, SessionLink, Tunnel, TunnelError};

/// Default bound on each pairing step.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(10);

const QUEUE: usize = 64;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake or tunnel error.
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// The code was refused. Deliberately says nothing about why.
    #[error("claim code denied")]
    Denied,

    /// Too many redemption attempts from this address.
    #[error("rate limited, try again later")]
    RateLimited,

    /// Any other relay refusal.
    #[error("relay error: {0}")]
    Relay(String),

    /// The relay did not answer in time.
    #[error("timed out waiting for the relay")]
    Timeout,

    /// The relay sent something out of order.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}

/// Pairs with instances through a relay.
#[derive(Debug, Clone)]
pub struct TunnelClient<T> {
    transport: T,
    relay_url: String,
    timeout: Duration,
}

impl<T: Transport> TunnelClient<T> {
    /// Create a client for the relay's client endpoint.
    pub fn new(transport: T, relay_url: impl Into<String>) -> Self {
        Self {
            transport,
            relay_url: relay_url.into(),
            timeout: DEFAULT_PAIR_TIMEOUT,
        }
    }

    /// Bound each step (socket open, redeem reply, handshake read).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Redeem `code` and open a tunnel to the instance behind it.
    pub async fn pair(
        &self,
        code: &str,
        keypair: Keypair,
        device: &DeviceInfo,
    ) -> Result<Tunnel, ClientError> {
        let Connection {
            mut sink,
            mut stream,
        } = tokio::time::timeout(self.timeout, self.transport.connect(&self.relay_url))
            .await
            .map_err(|_| ClientError::Timeout)??;

        sink.send(RelayMessage::Redeem {
            code: code.to_string(),
            client_public_key: keypair.public_key(),
        })
        .await?;

        let (session_id, instance_key) = loop {
            let next = tokio::time::timeout(self.timeout, stream.recv())
                .await
                .map_err(|_| ClientError::Timeout)?;
            match next {
                Some(Ok(RelayMessage::Paired {
                    session_id,
                    instance_public_key,
                })) => break (session_id, instance_public_key),
                Some(Ok(RelayMessage::Error { message })) => {
                    return Err(match message.as_str() {
                        DENIED => ClientError::Denied,
                        RATE_LIMITED => ClientError::RateLimited,
                        _ => ClientError::Relay(message),
                    });
                }
                Some(Ok(RelayMessage::Ping)) => sink.send(RelayMessage::Pong).await?,
                Some(Ok(other)) => return Err(ClientError::UnexpectedMessage(other.kind())),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::ConnectionClosed.into()),
            }
        };
        tracing::info!(session = ?session_id, instance = ?instance_key, "Paired, starting handshake");

        let (outbound, mut queue) = mpsc::channel::<RelayMessage>(QUEUE);
        let (inbound_tx, inbound) = mpsc::channel(QUEUE);

        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("Relay write failed: {}", e);
                    break;
                }
            }
            sink.close().await;
        });
        tokio::spawn(read_session(
            stream,
            session_id,
            inbound_tx,
            outbound.downgrade(),
        ));

        let noise = NoiseSession::initialize(Role::Initiator, keypair, Some(instance_key));
        let link = SessionLink::new(session_id, outbound, inbound);
        let tunnel = establish(noise, link, Some(device), self.timeout).await?;
        Ok(tunnel)
    }
}

/// Forward this session's frames until the relay closes it or nobody
/// reads any more.
async fn read_session(
    mut stream: Box<dyn RelayStream>,
    session_id: SessionId,
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::WeakSender<RelayMessage>,
) {
    loop {
        let next = tokio::select! {
            next = stream.recv() => next,
            _ = inbound.closed() => break,
        };
        match next {
            Some(Ok(RelayMessage::Frame {
                session_id: sid,
                payload,
            })) if sid == session_id => {
                if inbound.send(payload).await.is_err() {
                    break;
                }
            }
            Some(Ok(RelayMessage::Close { session_id: sid })) if sid == session_id => {
                tracing::debug!(session = ?session_id, "Session closed by relay");
                break;
            }
            Some(Ok(RelayMessage::Ping)) => {
                if let Some(outbound) = outbound.upgrade() {
                    let _ = outbound.try_send(RelayMessage::Pong);
                }
            }
            Some(Ok(RelayMessage::Error { message })) => {
                tracing::warn!(session = ?session_id, "Relay reported: {}", message)
            }
            Some(Ok(other)) => {
                tracing::debug!(kind = other.kind(), "Ignoring unexpected relay message")
            }
            Some(Err(e)) => {
                tracing::debug!("Relay read failed: {}", e);
                break;
            }
            None => break,
        }
    }
}
