//! WebSocket transport over tokio-tungstenite.

use super::{Connection, RelaySink, RelayStream, Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use zerok_tunnel_types::RelayMessage;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` or `wss://` sockets to the relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Create a WebSocket transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(url, "Relay socket open");

        let (sink, stream) = socket.split();
        Ok(Connection {
            sink: Box::new(WsSink { sink }),
            stream: Box::new(WsStream { stream }),
        })
    }
}

struct WsSink {
    sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl RelaySink for WsSink {
    async fn send(&mut self, message: RelayMessage) -> Result<(), TransportError> {
        let text = message
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl RelayStream for WsStream {
    async fn recv(&mut self) -> Option<Result<RelayMessage, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                    Ok(message) => return Some(Ok(message)),
                    Err(e) => {
                        tracing::warn!("Undecodable relay envelope: {}", e);
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            }
        }
    }
}
