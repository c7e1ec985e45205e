//! Serve command - run this machine as an instance.
//!
//! Keeps a link to the relay, prints a claim code, and echoes every
//! message a paired client sends back through its tunnel.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use zerok_tunnel_instance::{
    LinkNotice, ManagerConfig, RelayConnectionManager, Tunnel, TunnelError, WsTransport,
};

use crate::config::{load_identity, InstanceConfig};

enum Startup {
    Registered(Result<(), zerok_tunnel_instance::ManagerError>),
    Interrupted,
}

/// Run the serve command.
pub async fn run(data_dir: &Path, ttl_secs: Option<u64>) -> Result<()> {
    let config = InstanceConfig::load(data_dir).await?;
    let identity = load_identity(data_dir).await?;

    let manager_config = ManagerConfig::new(
        config.instance_endpoint(),
        identity.instance_id,
        identity.keypair,
    );
    let (manager, mut tunnels) = RelayConnectionManager::spawn(manager_config, WsTransport::new());
    let mut notices = manager.subscribe();

    println!("Connecting to {} as '{}'...", config.relay_url, config.instance_name);
    let startup = tokio::select! {
        result = manager.wait_registered() => Startup::Registered(result),
        _ = tokio::signal::ctrl_c() => Startup::Interrupted,
    };
    match startup {
        Startup::Registered(result) => {
            if let Err(e) = result {
                manager.shutdown().await;
                return Err(e).context("Relay link failed");
            }
        }
        Startup::Interrupted => {
            manager.shutdown().await;
            return Ok(());
        }
    }

    let claim = manager
        .issue_claim_code(ttl_secs.map(Duration::from_secs))
        .await
        .context("Failed to get a claim code")?;

    println!();
    println!("Claim code: {}", claim.code.grouped());
    println!("  Expires in {}s. Pair with:", remaining_secs(claim.expires_at));
    println!("  tunnel-cli pair {} --relay {}", claim.code, config.relay_url);
    println!();
    println!("Waiting for clients (Ctrl+C to stop)...");

    loop {
        tokio::select! {
            tunnel = tunnels.recv() => match tunnel {
                Some(tunnel) => {
                    tokio::spawn(echo(tunnel));
                }
                None => break,
            },
            notice = notices.recv() => match notice {
                Ok(LinkNotice::Registered) => println!("Relay link up"),
                Ok(LinkNotice::Disconnected { reason }) => println!("Relay link down: {reason}"),
                Ok(LinkNotice::Fatal { reason }) => {
                    eprintln!("Relay link failed: {reason}");
                    break;
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn echo(mut tunnel: Tunnel) {
    let device = tunnel
        .peer_device()
        .map(|d| format!("{} ({}, {})", d.device_name, d.device_type, d.device_os))
        .unwrap_or_else(|| "unknown device".to_string());
    println!("  Paired with {device}");

    loop {
        match tunnel.receive().await {
            Ok(message) => {
                if let Err(e) = tunnel.send(&message).await {
                    tracing::warn!("Echo failed: {}", e);
                    break;
                }
            }
            Err(TunnelError::Closed) => break,
            Err(e) => {
                tracing::warn!("Tunnel error: {}", e);
                break;
            }
        }
    }
    println!("  Session with {device} ended");
}

/// Seconds until `expires_at`, never negative.
fn remaining_secs(expires_at: i64) -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    (expires_at - now).max(0)
}
