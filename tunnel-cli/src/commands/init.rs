//! Initialize instance identity.

use anyhow::{Context, Result};
use std::path::Path;
use zerok_tunnel_instance::Identity;

use crate::config::{identity_path, set_dir_permissions_0700, InstanceConfig};

/// Run the init command.
pub async fn run(data_dir: &Path, relay_url: &str, name: &str) -> Result<()> {
    if !relay_url.starts_with("ws://") && !relay_url.starts_with("wss://") {
        anyhow::bail!("Relay URL must start with ws:// or wss://, got {relay_url}");
    }

    // Check if already initialized
    if InstanceConfig::exists(data_dir) {
        anyhow::bail!(
            "Instance already initialized. Delete {} to reinitialize.",
            data_dir.display()
        );
    }
    set_dir_permissions_0700(data_dir).await?;

    let identity = Identity::generate();
    identity
        .save(&identity_path(data_dir))
        .await
        .context("Failed to save instance identity")?;
    let config = InstanceConfig::new(relay_url, name);
    config.save(data_dir).await?;

    println!("Instance initialized successfully!");
    println!();
    println!("  Instance ID: {}", identity.instance_id);
    println!("  Public key:  {}", identity.public_key());
    println!("  Name:        {}", config.instance_name);
    println!("  Relay:       {}", config.relay_url);
    println!("  Data dir:    {}", data_dir.display());
    println!();
    println!("Next step:");
    println!("  tunnel-cli serve    # connect to the relay and print a claim code");

    Ok(())
}
