//! # tunnel-instance
//!
//! The two endpoints of 0k-Tunnel: the instance that keeps a persistent
//! link to the relay, and the client that pairs with it by claim code.
//!
//! ## Features
//!
//! - **Relay Connection Manager**: register, heartbeat, backoff and
//!   per-session demultiplexing behind one supervisor task
//! - **Pairing Client**: redeem a claim code and handshake against the
//!   instance key the relay returns
//! - **Noise Tunnels**: every payload sealed end to end; the relay only
//!   sees ciphertext
//! - **Transport Abstraction**: WebSocket for real sockets, mock for tests
//!
//! ## Example
//!
//! ```ignore
//! use zerok_tunnel_instance::{Identity, ManagerConfig, RelayConnectionManager, WsTransport};
//!
//! let identity = Identity::load_or_create(&path).await?;
//! let config = ManagerConfig::new(url, identity.instance_id, identity.keypair);
//! let (manager, mut tunnels) = RelayConnectionManager::spawn(config, WsTransport::new());
//!
//! manager.wait_registered().await?;
//! let claim = manager.issue_claim_code(None).await?;
//! println!("Pair with {}", claim.code.grouped());
//!
//! while let Some(mut tunnel) = tunnels.recv().await {
//!     let request = tunnel.receive().await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod identity;
pub mod manager;
pub mod transport;
pub mod tunnel;

pub use client::{ClientError, TunnelClient, DEFAULT_PAIR_TIMEOUT};
pub use identity::{Identity, IdentityError};
pub use manager::{
    IssuedClaim, ManagerConfig, ManagerError, ManagerHandle, NetworkStats, RelayConnectionManager,
};
pub use transport::{
    Connection, MockRelayEnd, MockTransport, RelaySink, RelayStream, Transport, TransportError,
    WsTransport,
};
pub use tunnel::{Tunnel, TunnelError, TunnelReceiver, TunnelSender, MAX_PLAINTEXT_LEN};
pub use zerok_tunnel_core::{Keypair, LinkNotice, LinkState};
