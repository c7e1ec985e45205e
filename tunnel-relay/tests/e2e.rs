//! End-to-end pairing through a real relay on a loopback socket.
//!
//! An instance registers over WebSocket, mints a claim code, and a client
//! redeems it and handshakes through the relay's frame forwarding.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tunnel_core::{NoiseSession, Role};
use tunnel_instance::{
    ClientError, Keypair, ManagerConfig, ManagerHandle, RelayConnectionManager, Tunnel,
    TunnelClient, TunnelError, WsTransport,
};
use tunnel_types::{DeviceInfo, InstanceId, RelayMessage};
use zerok_tunnel_relay::http::build_router;
use zerok_tunnel_relay::{Config, SqliteStorage, TunnelRelay};

const STEP: Duration = Duration::from_secs(10);

async fn start_relay() -> (SocketAddr, Arc<TunnelRelay>) {
    let mut config = Config::default();
    config.pairing.denial_floor_ms = 10;
    start_relay_with(config).await
}

async fn start_relay_with(config: Config) -> (SocketAddr, Arc<TunnelRelay>) {
    let storage = SqliteStorage::in_memory().await.unwrap();
    let relay = Arc::new(TunnelRelay::new(config, storage));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(relay.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, relay)
}

async fn start_instance(
    addr: SocketAddr,
) -> (ManagerHandle, tokio::sync::mpsc::Receiver<Tunnel>, Keypair) {
    let keypair = Keypair::generate();
    let config = ManagerConfig::new(
        format!("ws://{addr}/v1/instance"),
        InstanceId::new(),
        keypair.clone(),
    );
    let (manager, tunnels) = RelayConnectionManager::spawn(config, WsTransport::new());
    tokio::time::timeout(STEP, manager.wait_registered())
        .await
        .unwrap()
        .unwrap();
    (manager, tunnels, keypair)
}

fn client(addr: SocketAddr) -> TunnelClient<WsTransport> {
    TunnelClient::new(WsTransport::new(), format!("ws://{addr}/v1/client"))
}

fn device() -> DeviceInfo {
    DeviceInfo {
        device_name: "ci-runner".into(),
        device_type: "desktop".into(),
        device_os: "linux".into(),
    }
}

// ===========================================
// Pairing
// ===========================================

#[tokio::test]
async fn pair_and_talk_through_relay() {
    let (addr, relay) = start_relay().await;
    let (manager, mut tunnels, instance_key) = start_instance(addr).await;

    let claim = manager.issue_claim_code(None).await.unwrap();
    let client_key = Keypair::generate();
    let client_public = client_key.public_key();

    let client = client(addr);
    let pair_device = device();
    let (paired, accepted) = tokio::join!(
        client.pair(claim.code.as_str(), client_key, &pair_device),
        tokio::time::timeout(STEP, tunnels.recv())
    );
    let mut client_tunnel = paired.unwrap();
    let mut instance_tunnel = accepted.unwrap().unwrap();

    // Both ends proved the keys the relay brokered
    assert_eq!(client_tunnel.peer_public_key(), instance_key.public_key());
    assert_eq!(instance_tunnel.peer_public_key(), client_public);
    assert_eq!(instance_tunnel.peer_device(), Some(&device()));
    assert_eq!(client_tunnel.handshake_hash(), instance_tunnel.handshake_hash());
    assert_eq!(client_tunnel.session_id(), instance_tunnel.session_id());

    client_tunnel.send(b"hostname").await.unwrap();
    assert_eq!(instance_tunnel.receive().await.unwrap(), b"hostname");
    instance_tunnel.send(b"build-box-7").await.unwrap();
    assert_eq!(client_tunnel.receive().await.unwrap(), b"build-box-7");

    assert!(relay.metrics().frames_relayed_total.load(Ordering::Relaxed) >= 5);
    assert_eq!(relay.router().session_count(), 1);

    // The code was single-use
    let again = client.pair(claim.code.as_str(), Keypair::generate(), &device()).await;
    assert!(matches!(again, Err(ClientError::Denied)));

    manager.shutdown().await;
}

#[tokio::test]
async fn closing_client_ends_instance_tunnel() {
    let (addr, _relay) = start_relay().await;
    let (manager, mut tunnels, _) = start_instance(addr).await;
    let claim = manager.issue_claim_code(None).await.unwrap();

    let client = client(addr);
    let pair_device = device();
    let (paired, accepted) = tokio::join!(
        client.pair(claim.code.as_str(), Keypair::generate(), &pair_device),
        tokio::time::timeout(STEP, tunnels.recv())
    );
    let client_tunnel = paired.unwrap();
    let mut instance_tunnel = accepted.unwrap().unwrap();

    drop(client_tunnel);
    let ended = tokio::time::timeout(STEP, instance_tunnel.receive())
        .await
        .unwrap();
    assert!(matches!(ended, Err(TunnelError::Closed)));

    manager.shutdown().await;
}

#[tokio::test]
async fn wire_never_repeats_ciphertext() {
    let (addr, _relay) = start_relay().await;
    let (manager, mut tunnels, instance_key) = start_instance(addr).await;
    let claim = manager.issue_claim_code(None).await.unwrap();

    // A hand-driven client socket so the test sees exactly what the relay forwards
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/v1/client"))
        .await
        .unwrap();
    let client_key = Keypair::generate();
    let send = |msg: RelayMessage| Message::Text(msg.to_json().unwrap());

    socket
        .send(send(RelayMessage::Redeem {
            code: claim.code.to_string(),
            client_public_key: client_key.public_key(),
        }))
        .await
        .unwrap();
    let (session_id, pinned) = match read_envelope(&mut socket).await {
        RelayMessage::Paired {
            session_id,
            instance_public_key,
        } => (session_id, instance_public_key),
        other => panic!("expected paired, got {other:?}"),
    };
    assert_eq!(pinned, instance_key.public_key());

    let mut noise = NoiseSession::initialize(Role::Initiator, client_key, Some(pinned));
    let frame = |payload: Vec<u8>| RelayMessage::Frame {
        session_id,
        payload,
    };
    socket
        .send(send(frame(noise.write_message(&[]).unwrap())))
        .await
        .unwrap();
    let RelayMessage::Frame { payload, .. } = read_envelope(&mut socket).await else {
        panic!("expected handshake frame");
    };
    noise.read_message(&payload).unwrap();
    socket
        .send(send(frame(
            noise.write_message(&device().to_bytes().unwrap()).unwrap(),
        )))
        .await
        .unwrap();
    let (mut client_send, mut client_recv) = noise.split().unwrap();

    let mut instance_tunnel = tokio::time::timeout(STEP, tunnels.recv())
        .await
        .unwrap()
        .unwrap();

    // Instance to client: same plaintext, distinct bytes every time
    let mut seen = HashSet::new();
    for _ in 0..4 {
        instance_tunnel.send(b"same").await.unwrap();
        let RelayMessage::Frame { payload, .. } = read_envelope(&mut socket).await else {
            panic!("expected frame");
        };
        assert!(seen.insert(payload.clone()), "ciphertext repeated on the wire");
        assert_eq!(
            client_recv
                .decrypt_with_ad(session_id.as_bytes(), &payload)
                .unwrap(),
            b"same"
        );
    }

    // Client to instance
    for _ in 0..4 {
        let ciphertext = client_send
            .encrypt_with_ad(session_id.as_bytes(), b"same")
            .unwrap();
        assert!(seen.insert(ciphertext.clone()), "ciphertext repeated on the wire");
        socket.send(send(frame(ciphertext))).await.unwrap();
        assert_eq!(instance_tunnel.receive().await.unwrap(), b"same");
    }

    manager.shutdown().await;
}

async fn read_envelope<S>(socket: &mut S) -> RelayMessage
where
    S: futures_util::stream::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(STEP, async {
        loop {
            if let Message::Text(text) = socket.next().await.unwrap().unwrap() {
                return RelayMessage::from_json(&text).unwrap();
            }
        }
    })
    .await
    .unwrap()
}

// ===========================================
// Refusals
// ===========================================

#[tokio::test]
async fn bad_codes_are_denied_then_rate_limited() {
    let (addr, _relay) = start_relay().await;
    let client = client(addr);

    let mut outcomes = Vec::new();
    for _ in 0..6 {
        let result = client.pair("ZZZZ9999", Keypair::generate(), &device()).await;
        outcomes.push(result.unwrap_err());
    }

    assert!(outcomes[..5]
        .iter()
        .all(|e| matches!(e, ClientError::Denied)));
    assert!(matches!(outcomes[5], ClientError::RateLimited));
}

#[tokio::test]
async fn offline_instance_burns_the_code() {
    let (addr, relay) = start_relay().await;
    let (manager, _tunnels, _) = start_instance(addr).await;
    let claim = manager.issue_claim_code(None).await.unwrap();

    manager.shutdown().await;
    tokio::time::timeout(STEP, async {
        while relay.router().instance_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let client = client(addr);
    match client.pair(claim.code.as_str(), Keypair::generate(), &device()).await {
        Err(ClientError::Relay(message)) => assert_eq!(message, "connection unavailable"),
        other => panic!("unexpected result: {other:?}"),
    }
    let again = client.pair(claim.code.as_str(), Keypair::generate(), &device()).await;
    assert!(matches!(again, Err(ClientError::Denied)));
}

#[tokio::test]
async fn silent_client_socket_is_closed() {
    let mut config = Config::default();
    config.limits.redeem_timeout_secs = 1;
    let (addr, _relay) = start_relay_with(config).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/v1/client"))
        .await
        .unwrap();

    // Pings do not count as pairing
    socket
        .send(Message::Text(RelayMessage::Ping.to_json().unwrap()))
        .await
        .unwrap();

    let closed = tokio::time::timeout(STEP, async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay kept an unpaired client socket open");
}
