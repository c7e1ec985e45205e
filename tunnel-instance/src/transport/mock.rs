//! Mock transport for testing.
//!
//! Every successful `connect()` produces a [`MockRelayEnd`] that the test
//! picks up with [`MockTransport::next_connection`] and drives by hand.

use super::{Connection, RelaySink, RelayStream, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zerok_tunnel_types::RelayMessage;

/// Mock transport for testing.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    accepted: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRelayEnd>>>,
}

#[derive(Debug)]
struct MockTransportInner {
    connect_attempts: Vec<String>,
    fail_connects: VecDeque<String>,
    accepted_tx: mpsc::UnboundedSender<MockRelayEnd>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner {
                connect_attempts: Vec::new(),
                fail_connects: VecDeque::new(),
                accepted_tx,
            })),
            accepted: Arc::new(tokio::sync::Mutex::new(accepted_rx)),
        }
    }

    /// Cause the next connect() to fail with the given error.
    ///
    /// Calls stack: each queued failure is used once.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_connects.push_back(error.to_string());
    }

    /// Every URL connect() was called with, failures included.
    pub fn connect_attempts(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.connect_attempts.clone()
    }

    /// Wait for the next successful connect and return the relay end.
    pub async fn next_connection(&self) -> MockRelayEnd {
        let mut accepted = self.accepted.lock().await;
        accepted
            .recv()
            .await
            .expect("MockTransport sender lives as long as the transport")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_attempts.push(url.to_string());

        // Check for forced failure
        if let Some(error) = inner.fail_connects.pop_front() {
            return Err(TransportError::ConnectionFailed(error));
        }

        let (to_instance, instance_rx) = mpsc::unbounded_channel();
        let (instance_tx, from_instance) = mpsc::unbounded_channel();
        let end = MockRelayEnd {
            url: url.to_string(),
            to_instance: Some(to_instance),
            from_instance,
        };
        inner
            .accepted_tx
            .send(end)
            .map_err(|_| TransportError::ConnectionFailed("mock dropped".into()))?;

        Ok(Connection {
            sink: Box::new(MockSink {
                tx: Some(instance_tx),
            }),
            stream: Box::new(MockStream { rx: instance_rx }),
        })
    }
}

/// The relay side of one mock socket.
#[derive(Debug)]
pub struct MockRelayEnd {
    url: String,
    to_instance: Option<mpsc::UnboundedSender<RelayMessage>>,
    from_instance: mpsc::UnboundedReceiver<RelayMessage>,
}

impl MockRelayEnd {
    /// URL the socket was opened with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a message to the instance. Ignored once closed.
    pub fn send(&self, message: RelayMessage) {
        if let Some(tx) = &self.to_instance {
            let _ = tx.send(message);
        }
    }

    /// Next message the instance sent. `None` once it closed the socket.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.from_instance.recv().await
    }

    /// Close the socket from the relay side.
    pub fn close(&mut self) {
        self.to_instance = None;
    }
}

struct MockSink {
    tx: Option<mpsc::UnboundedSender<RelayMessage>>,
}

#[async_trait]
impl RelaySink for MockSink {
    async fn send(&mut self, message: RelayMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<RelayMessage>,
}

#[async_trait]
impl RelayStream for MockStream {
    async fn recv(&mut self) -> Option<Result<RelayMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let transport = MockTransport::new();
        let mut conn = transport.connect("ws://relay/v1/instance").await.unwrap();
        let mut relay = transport.next_connection().await;
        assert_eq!(relay.url(), "ws://relay/v1/instance");

        conn.sink.send(RelayMessage::Ping).await.unwrap();
        assert_eq!(relay.recv().await, Some(RelayMessage::Ping));

        relay.send(RelayMessage::Pong);
        assert_eq!(conn.stream.recv().await.unwrap().unwrap(), RelayMessage::Pong);
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let transport = MockTransport::new();
        transport.fail_next_connect("refused");

        let result = transport.connect("ws://relay").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(transport.connect("ws://relay").await.is_ok());
        assert_eq!(transport.connect_attempts().len(), 2);
    }

    #[tokio::test]
    async fn relay_close_ends_stream() {
        let transport = MockTransport::new();
        let mut conn = transport.connect("ws://relay").await.unwrap();
        let mut relay = transport.next_connection().await;

        relay.close();
        assert!(conn.stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_relay_end_fails_sends() {
        let transport = MockTransport::new();
        let mut conn = transport.connect("ws://relay").await.unwrap();
        drop(transport.next_connection().await);

        let result = conn.sink.send(RelayMessage::Ping).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
