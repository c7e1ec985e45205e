//! Encrypted tunnels over relayed sessions.
//!
//! A [`Tunnel`] is what the application sees once the Noise handshake for
//! a session is done: `send(bytes)` and `receive() -> bytes`. Every
//! message is sealed with the session's transport cipher, using the
//! session id as associated data, and travels as a relay `frame`.
//!
//! Dropping the last half of a tunnel sends `close` for its session.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use zerok_tunnel_core::{CipherState, NoiseError, NoiseSession, Role, MAX_MESSAGE_LEN, TAG_LEN};
use zerok_tunnel_types::{DeviceInfo, PublicKey, RelayMessage, SessionId};

/// Largest plaintext a single `send` accepts.
pub const MAX_PLAINTEXT_LEN: usize = MAX_MESSAGE_LEN - TAG_LEN;

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Noise failure. Fatal to the tunnel unless it is `MessageTooLarge`.
    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),

    /// The session or its socket is gone.
    #[error("tunnel closed")]
    Closed,

    /// The peer did not answer a handshake step in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer's handshake payload did not decode.
    #[error("invalid handshake payload: {0}")]
    InvalidPayload(String),
}

/// Sends `close` for a session when the last tunnel half goes away.
#[derive(Debug)]
pub(crate) struct CloseGuard {
    session_id: SessionId,
    outbound: mpsc::Sender<RelayMessage>,
}

impl CloseGuard {
    pub(crate) fn new(session_id: SessionId, outbound: mpsc::Sender<RelayMessage>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            outbound,
        })
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let _ = self.outbound.try_send(RelayMessage::Close {
            session_id: self.session_id,
        });
    }
}

/// Raw plumbing for one session before and after the handshake.
#[derive(Debug)]
pub(crate) struct SessionLink {
    pub(crate) session_id: SessionId,
    pub(crate) outbound: mpsc::Sender<RelayMessage>,
    pub(crate) inbound: mpsc::Receiver<Vec<u8>>,
    pub(crate) guard: Arc<CloseGuard>,
}

impl SessionLink {
    pub(crate) fn new(
        session_id: SessionId,
        outbound: mpsc::Sender<RelayMessage>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let guard = CloseGuard::new(session_id, outbound.clone());
        Self {
            session_id,
            outbound,
            inbound,
            guard,
        }
    }

    async fn send_frame(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.outbound
            .send(RelayMessage::Frame {
                session_id: self.session_id,
                payload,
            })
            .await
            .map_err(|_| TunnelError::Closed)
    }

    async fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TunnelError> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(TunnelError::Closed),
            Err(_) => Err(TunnelError::HandshakeTimeout),
        }
    }
}

/// Run the XX handshake for `link` and build the tunnel.
///
/// The initiator sends `device` in the third message; the responder
/// reads it. Each read waits at most `timeout`.
pub(crate) async fn establish(
    mut noise: NoiseSession,
    mut link: SessionLink,
    device: Option<&DeviceInfo>,
    timeout: Duration,
) -> Result<Tunnel, TunnelError> {
    let final_payload = match device {
        Some(info) => info
            .to_bytes()
            .map_err(|e| TunnelError::InvalidPayload(e.to_string()))?,
        None => Vec::new(),
    };
    let mut peer_payload = Vec::new();

    while !noise.is_complete() {
        if noise.is_my_turn() {
            // Only the third message is encrypted to an authenticated peer
            let payload: &[u8] = if noise.message_index() == 2 {
                &final_payload
            } else {
                &[]
            };
            let message = noise.write_message(payload)?;
            link.send_frame(message).await?;
        } else {
            let message = link.recv_frame(timeout).await?;
            let payload = noise.read_message(&message)?;
            if !payload.is_empty() {
                peer_payload = payload;
            }
        }
    }

    let peer_device = if noise.role() == Role::Responder && !peer_payload.is_empty() {
        Some(
            DeviceInfo::from_bytes(&peer_payload)
                .map_err(|e| TunnelError::InvalidPayload(e.to_string()))?,
        )
    } else {
        None
    };

    let peer_public_key = noise
        .remote_static()
        .ok_or_else(|| NoiseError::Handshake("remote static key missing".into()))?;
    let handshake_hash = noise.handshake_hash();
    let (send, recv) = noise.split()?;

    tracing::debug!(session = ?link.session_id, peer = ?peer_public_key, "Handshake complete");

    let SessionLink {
        session_id,
        outbound,
        inbound,
        guard,
    } = link;

    Ok(Tunnel {
        session_id,
        peer_public_key,
        peer_device,
        handshake_hash,
        sender: TunnelSender {
            session_id,
            cipher: send,
            outbound,
            _guard: guard.clone(),
        },
        receiver: TunnelReceiver {
            session_id,
            cipher: recv,
            inbound,
            _guard: guard,
        },
    })
}

/// An established, mutually authenticated tunnel.
#[derive(Debug)]
pub struct Tunnel {
    session_id: SessionId,
    peer_public_key: PublicKey,
    peer_device: Option<DeviceInfo>,
    handshake_hash: [u8; 32],
    sender: TunnelSender,
    receiver: TunnelReceiver,
}

impl Tunnel {
    /// Relay session this tunnel rides on.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Static key the peer proved during the handshake.
    pub fn peer_public_key(&self) -> PublicKey {
        self.peer_public_key
    }

    /// Device description the client sent. Only set on the instance side.
    pub fn peer_device(&self) -> Option<&DeviceInfo> {
        self.peer_device.as_ref()
    }

    /// Transcript hash, identical on both ends.
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.handshake_hash
    }

    /// Encrypt and send one message.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), TunnelError> {
        self.sender.send(plaintext).await
    }

    /// Receive and decrypt the next message.
    pub async fn receive(&mut self) -> Result<Vec<u8>, TunnelError> {
        self.receiver.receive().await
    }

    /// Split into halves that can live on different tasks.
    pub fn split(self) -> (TunnelSender, TunnelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`Tunnel`].
#[derive(Debug)]
pub struct TunnelSender {
    session_id: SessionId,
    cipher: CipherState,
    outbound: mpsc::Sender<RelayMessage>,
    _guard: Arc<CloseGuard>,
}

impl TunnelSender {
    /// Encrypt and send one message.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), TunnelError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(NoiseError::MessageTooLarge(plaintext.len()).into());
        }
        let ciphertext = self
            .cipher
            .encrypt_with_ad(self.session_id.as_bytes(), plaintext)?;
        self.outbound
            .send(RelayMessage::Frame {
                session_id: self.session_id,
                payload: ciphertext,
            })
            .await
            .map_err(|_| TunnelError::Closed)
    }
}

/// Receiving half of a [`Tunnel`].
#[derive(Debug)]
pub struct TunnelReceiver {
    session_id: SessionId,
    cipher: CipherState,
    inbound: mpsc::Receiver<Vec<u8>>,
    _guard: Arc<CloseGuard>,
}

impl TunnelReceiver {
    /// Receive and decrypt the next message.
    ///
    /// A frame that fails authentication poisons the tunnel; every later
    /// call fails too.
    pub async fn receive(&mut self) -> Result<Vec<u8>, TunnelError> {
        if self.cipher.is_aborted() {
            return Err(NoiseError::Aborted.into());
        }
        let ciphertext = self.inbound.recv().await.ok_or(TunnelError::Closed)?;
        let plaintext = self
            .cipher
            .decrypt_with_ad(self.session_id.as_bytes(), &ciphertext)
            .inspect_err(|e| {
                tracing::warn!(session = ?self.session_id, "Dropping tunnel: {}", e);
            })?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerok_tunnel_core::Keypair;

    struct Wire {
        relay_rx: mpsc::Receiver<RelayMessage>,
        inbound_tx: mpsc::Sender<Vec<u8>>,
    }

    fn link(session_id: SessionId) -> (SessionLink, Wire) {
        let (outbound, relay_rx) = mpsc::channel(16);
        let (inbound_tx, inbound) = mpsc::channel(16);
        (
            SessionLink::new(session_id, outbound, inbound),
            Wire {
                relay_rx,
                inbound_tx,
            },
        )
    }

    /// Shuttle frames between two links like the relay would.
    fn spawn_relay(mut a: Wire, mut b: Wire) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = a.relay_rx.recv() => {
                        if let RelayMessage::Frame { payload, .. } = msg {
                            if b.inbound_tx.send(payload).await.is_err() { break; }
                        }
                    }
                    Some(msg) = b.relay_rx.recv() => {
                        if let RelayMessage::Frame { payload, .. } = msg {
                            if a.inbound_tx.send(payload).await.is_err() { break; }
                        }
                    }
                    else => break,
                }
            }
        });
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_name: "laptop".into(),
            device_type: "desktop".into(),
            device_os: "linux".into(),
        }
    }

    async fn tunnel_pair() -> (Tunnel, Tunnel) {
        let session_id = SessionId::new();
        let client_key = Keypair::generate();
        let instance_key = Keypair::generate();
        let client_pub = client_key.public_key();
        let instance_pub = instance_key.public_key();

        let (client_link, client_wire) = link(session_id);
        let (instance_link, instance_wire) = link(session_id);
        spawn_relay(client_wire, instance_wire);

        let timeout = Duration::from_secs(5);
        let client_device = device();
        let client = establish(
            NoiseSession::initialize(Role::Initiator, client_key, Some(instance_pub)),
            client_link,
            Some(&client_device),
            timeout,
        );
        let instance = establish(
            NoiseSession::initialize(Role::Responder, instance_key, Some(client_pub)),
            instance_link,
            None,
            timeout,
        );
        let (client, instance) = tokio::join!(client, instance);
        (client.unwrap(), instance.unwrap())
    }

    #[tokio::test]
    async fn handshake_delivers_device_info_and_keys() {
        let (client, instance) = tunnel_pair().await;
        assert_eq!(instance.peer_device(), Some(&device()));
        assert!(client.peer_device().is_none());
        assert_eq!(client.handshake_hash(), instance.handshake_hash());
        assert_eq!(client.session_id(), instance.session_id());
    }

    #[tokio::test]
    async fn messages_round_trip_both_ways() {
        let (mut client, mut instance) = tunnel_pair().await;

        client.send(b"hello instance").await.unwrap();
        assert_eq!(instance.receive().await.unwrap(), b"hello instance");

        instance.send(b"hello client").await.unwrap();
        assert_eq!(client.receive().await.unwrap(), b"hello client");
    }

    #[tokio::test]
    async fn split_halves_work_independently() {
        let (client, instance) = tunnel_pair().await;
        let (mut tx, _rx) = client.split();
        let (_itx, mut irx) = instance.split();

        tx.send(b"one").await.unwrap();
        tx.send(b"two").await.unwrap();
        assert_eq!(irx.receive().await.unwrap(), b"one");
        assert_eq!(irx.receive().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn oversize_plaintext_is_refused() {
        let (mut client, _instance) = tunnel_pair().await;
        let big = vec![0u8; MAX_PLAINTEXT_LEN + 1];
        assert!(matches!(
            client.send(&big).await,
            Err(TunnelError::Noise(NoiseError::MessageTooLarge(_)))
        ));
    }

    #[tokio::test]
    async fn wrong_pin_fails_handshake() {
        let session_id = SessionId::new();
        let (client_link, client_wire) = link(session_id);
        let (instance_link, instance_wire) = link(session_id);
        spawn_relay(client_wire, instance_wire);

        let instance_key = Keypair::generate();
        let wrong = Keypair::generate().public_key();
        let client_device = device();
        let client = establish(
            NoiseSession::initialize(Role::Initiator, Keypair::generate(), Some(wrong)),
            client_link,
            Some(&client_device),
            Duration::from_secs(1),
        );
        let instance = establish(
            NoiseSession::initialize(Role::Responder, instance_key, None),
            instance_link,
            None,
            Duration::from_secs(1),
        );
        let (client, _instance) = tokio::join!(client, instance);
        assert!(matches!(
            client,
            Err(TunnelError::Noise(NoiseError::RemoteKeyMismatch))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let session_id = SessionId::new();
        let (instance_link, _wire) = link(session_id);
        let result = establish(
            NoiseSession::initialize(Role::Responder, Keypair::generate(), None),
            instance_link,
            None,
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(TunnelError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn dropping_tunnel_sends_close() {
        let session_id = SessionId::new();
        let (outbound, mut relay_rx) = mpsc::channel(4);
        let (_inbound_tx, inbound) = mpsc::channel(4);
        let link = SessionLink::new(session_id, outbound, inbound);
        drop(link);
        assert_eq!(
            relay_rx.recv().await,
            Some(RelayMessage::Close { session_id })
        );
    }
}
