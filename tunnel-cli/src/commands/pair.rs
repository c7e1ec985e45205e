//! Pair command - redeem a claim code and talk to the instance.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use zerok_tunnel_instance::{ClientError, Keypair, Tunnel, TunnelClient, WsTransport};
use zerok_tunnel_types::DeviceInfo;

use crate::config::{endpoint, InstanceConfig};

/// Run the pair command.
///
/// Sends each of `messages` and prints the reply. With no messages, reads
/// lines from stdin until EOF.
pub async fn run(
    data_dir: &Path,
    code: &str,
    relay: Option<&str>,
    name: Option<&str>,
    messages: &[String],
) -> Result<()> {
    let relay_url = resolve_relay(data_dir, relay).await?;
    let client = TunnelClient::new(WsTransport::new(), endpoint(&relay_url, "/v1/client"));

    println!("Redeeming claim code via {relay_url}...");
    let mut tunnel = match client.pair(code, Keypair::generate(), &device_info(name)).await {
        Ok(tunnel) => tunnel,
        Err(ClientError::Denied) => {
            anyhow::bail!("Claim code denied. Check the code or ask the instance for a new one.")
        }
        Err(ClientError::RateLimited) => {
            anyhow::bail!("Too many attempts. Wait a minute and try again.")
        }
        Err(e) => return Err(e).context("Pairing failed"),
    };

    println!("Paired!");
    println!("  Instance key: {}", tunnel.peer_public_key());
    println!("  Session:      {}", tunnel.session_id());
    println!("  Fingerprint:  {}", fingerprint(&tunnel.handshake_hash()));
    println!();

    if messages.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            exchange(&mut tunnel, line.as_bytes()).await?;
        }
    } else {
        for message in messages {
            exchange(&mut tunnel, message.as_bytes()).await?;
        }
    }
    Ok(())
}

async fn exchange(tunnel: &mut Tunnel, message: &[u8]) -> Result<()> {
    tunnel.send(message).await.context("Send failed")?;
    let reply = tunnel.receive().await.context("Receive failed")?;
    println!("< {}", String::from_utf8_lossy(&reply));
    Ok(())
}

/// Relay URL from the flag, falling back to the local instance config.
async fn resolve_relay(data_dir: &Path, relay: Option<&str>) -> Result<String> {
    if let Some(url) = relay {
        return Ok(url.trim_end_matches('/').to_string());
    }
    if InstanceConfig::exists(data_dir) {
        return Ok(InstanceConfig::load(data_dir).await?.relay_url);
    }
    anyhow::bail!("No relay URL. Pass --relay ws://host:port or run 'tunnel-cli init' first.")
}

fn device_info(name: Option<&str>) -> DeviceInfo {
    DeviceInfo {
        device_name: name.unwrap_or("tunnel-cli").to_string(),
        device_type: "cli".to_string(),
        device_os: std::env::consts::OS.to_string(),
    }
}

/// Short transcript fingerprint both sides can compare by eye.
fn fingerprint(hash: &[u8; 32]) -> String {
    hash[..8]
        .chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}
