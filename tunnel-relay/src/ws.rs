//! WebSocket endpoints for instances and clients.
//!
//! Each socket is split: a writer task drains the session's bounded
//! outbound queue, the read loop decodes JSON envelopes and hands them
//! to the session.

use crate::server::{RelayMetrics, TunnelRelay};
use crate::session::{ClientSession, Flow, InstanceSession};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::ConnectInfo;
use axum::response::IntoResponse;
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tunnel_types::RelayMessage;

/// GET /v1/instance
pub async fn instance_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<Arc<TunnelRelay>>,
) -> impl IntoResponse {
    let max = relay.config().limits.max_frame_size * 2;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_instance(socket, addr, relay))
}

/// GET /v1/client
pub async fn client_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<Arc<TunnelRelay>>,
) -> impl IntoResponse {
    let max = relay.config().limits.max_frame_size * 2;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_client(socket, addr, relay))
}

async fn handle_instance(socket: WebSocket, addr: SocketAddr, relay: Arc<TunnelRelay>) {
    RelayMetrics::bump(&relay.metrics().connections_total);
    tracing::info!(%addr, "Instance socket opened");

    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(relay.config().limits.session_queue_bound.max(1));
    let writer = spawn_writer(ws_tx, rx);

    let mut session = InstanceSession::new(relay.clone(), addr.ip(), tx);
    let register_timeout = Duration::from_secs(relay.config().limits.register_timeout_secs);
    let deadline = tokio::time::sleep(register_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline, if !session.is_registered() => {
                tracing::warn!(%addr, "No register within {:?}, closing", register_timeout);
                break;
            }
            msg = ws_rx.next() => {
                let Some(message) = next_envelope(msg, &relay) else { break };
                match message {
                    Some(message) => {
                        if session.handle(message).await == Flow::Close {
                            break;
                        }
                    }
                    None => continue,
                }
            }
        }
    }

    session.finish().await;
    finish_writer(writer).await;
    tracing::info!(%addr, "Instance socket closed");
}

async fn handle_client(socket: WebSocket, addr: SocketAddr, relay: Arc<TunnelRelay>) {
    RelayMetrics::bump(&relay.metrics().connections_total);
    tracing::debug!(%addr, "Client socket opened");

    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(relay.config().limits.session_queue_bound.max(1));
    let writer = spawn_writer(ws_tx, rx);

    let mut session = ClientSession::new(relay.clone(), addr.ip(), tx);
    let redeem_timeout = Duration::from_secs(relay.config().limits.redeem_timeout_secs);
    let deadline = tokio::time::sleep(redeem_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline, if !session.is_paired() => {
                tracing::debug!(%addr, "Not paired within {:?}, closing", redeem_timeout);
                break;
            }
            msg = ws_rx.next() => {
                let Some(message) = next_envelope(msg, &relay) else { break };
                if let Some(message) = message {
                    if session.handle(message).await == Flow::Close {
                        break;
                    }
                }
            }
        }
    }

    session.finish().await;
    finish_writer(writer).await;
    tracing::debug!(%addr, "Client socket closed");
}

/// Decode the next socket item.
///
/// `None` means the socket is done; `Some(None)` means skip this item.
fn next_envelope(
    item: Option<Result<Message, axum::Error>>,
    relay: &TunnelRelay,
) -> Option<Option<RelayMessage>> {
    match item {
        None | Some(Ok(Message::Close(_))) => None,
        Some(Err(e)) => {
            tracing::debug!("Socket error: {}", e);
            None
        }
        Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
            Ok(message) => Some(Some(message)),
            Err(e) => {
                RelayMetrics::bump(&relay.metrics().errors_total);
                tracing::debug!("Undecodable envelope: {}", e);
                Some(None)
            }
        },
        // Ping/pong is answered by the socket layer
        Some(Ok(_)) => Some(None),
    }
}

fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<RelayMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(kind = message.kind(), "Could not encode envelope: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    })
}

/// Give the writer a moment to flush queued replies, then stop it.
///
/// The router may still hold clones of the queue sender, so the writer
/// is not guaranteed to see the channel close on its own.
async fn finish_writer(writer: JoinHandle<()>) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(Duration::from_millis(250), writer)
        .await
        .is_err()
    {
        abort.abort();
    }
}
