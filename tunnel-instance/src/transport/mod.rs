//! Transport abstraction for 0k-Tunnel.
//!
//! A transport opens one relay socket and hands back its two halves. The
//! sink is owned by a single writer task; the stream by a single reader.
//! Both carry decoded [`RelayMessage`]s.
//!
//! # Example
//!
//! ```ignore
//! let transport = WsTransport::new();
//! let conn = transport.connect("ws://relay:8080/v1/instance").await?;
//! let (mut sink, mut stream) = (conn.sink, conn.stream);
//! sink.send(RelayMessage::Ping).await?;
//! let reply = stream.recv().await;
//! ```

mod mock;
mod ws;

pub use mock::{MockRelayEnd, MockTransport};
pub use ws::WsTransport;

use async_trait::async_trait;
use thiserror::Error;
use zerok_tunnel_types::RelayMessage;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Write half of a relay socket.
#[async_trait]
pub trait RelaySink: Send {
    /// Send one envelope.
    async fn send(&mut self, message: RelayMessage) -> Result<(), TransportError>;

    /// Close the socket gracefully.
    async fn close(&mut self);
}

/// Read half of a relay socket.
#[async_trait]
pub trait RelayStream: Send {
    /// Next envelope. `None` once the socket is closed.
    async fn recv(&mut self) -> Option<Result<RelayMessage, TransportError>>;
}

/// An open relay socket.
pub struct Connection {
    /// Write half.
    pub sink: Box<dyn RelaySink>,
    /// Read half.
    pub stream: Box<dyn RelayStream>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens relay sockets.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`.
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}
