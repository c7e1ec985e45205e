//! Show instance status.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use zerok_tunnel_instance::{RelaySink, Transport, WsTransport};

use crate::config::{load_identity, InstanceConfig};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the status command. With `check`, also try to open a socket to
/// the relay.
pub async fn run(data_dir: &Path, check: bool) -> Result<()> {
    println!("=== tunnel-cli status ===");
    println!();

    let config = match InstanceConfig::load(data_dir).await {
        Ok(config) => config,
        Err(_) => {
            println!("Instance: NOT INITIALIZED");
            println!();
            println!("Run 'tunnel-cli init --relay <url>' to initialize.");
            return Ok(());
        }
    };

    println!("Instance:");
    println!("  Name:  {}", config.instance_name);
    println!("  Init:  {}", format_timestamp(config.created_at));
    match load_identity(data_dir).await {
        Ok(identity) => {
            println!("  ID:    {}", identity.instance_id);
            println!("  Key:   {}", identity.public_key());
        }
        Err(e) => println!("  Identity: UNREADABLE ({e:#})"),
    }

    println!();
    println!("Relay:");
    println!("  URL:    {}", config.relay_url);
    if check {
        let status = match tokio::time::timeout(
            PROBE_TIMEOUT,
            WsTransport::new().connect(&config.instance_endpoint()),
        )
        .await
        {
            Ok(Ok(mut connection)) => {
                connection.sink.close().await;
                "REACHABLE".to_string()
            }
            Ok(Err(e)) => format!("UNREACHABLE ({e})"),
            Err(_) => "UNREACHABLE (timed out)".to_string(),
        };
        println!("  Status: {status}");
    }

    Ok(())
}

/// Format a Unix timestamp as a human-readable string.
fn format_timestamp(ts: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let diff = now.saturating_sub(ts);

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_without_init() {
        let dir = tempdir().unwrap();
        assert!(run(dir.path(), false).await.is_ok());
    }

    #[tokio::test]
    async fn status_after_init() {
        let dir = tempdir().unwrap();
        crate::commands::init::run(dir.path(), "ws://relay.test", "Box")
            .await
            .unwrap();
        assert!(run(dir.path(), false).await.is_ok());
    }

    #[tokio::test]
    async fn check_reports_unreachable_relay() {
        let dir = tempdir().unwrap();
        // Nothing listens on port 1
        crate::commands::init::run(dir.path(), "ws://127.0.0.1:1", "Box")
            .await
            .unwrap();
        assert!(run(dir.path(), true).await.is_ok());
    }

    #[test]
    fn format_timestamp_works() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        assert_eq!(format_timestamp(now), "just now");
        assert!(format_timestamp(now - 120).contains("minutes"));
        assert!(format_timestamp(now - 7200).contains("hours"));
        assert!(format_timestamp(now - 172800).contains("days"));
    }
}
