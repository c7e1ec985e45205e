//! Configuration management for tunnel-cli.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zerok_tunnel_instance::Identity;

const CONFIG_FILE: &str = "config.json";
const IDENTITY_FILE: &str = "identity.json";

/// Instance configuration stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Relay base URL, e.g. `ws://relay.example:8080`.
    pub relay_url: String,
    /// Human-readable instance name.
    pub instance_name: String,
    /// When the instance was initialized.
    pub created_at: u64,
}

impl InstanceConfig {
    /// Create a new instance configuration.
    pub fn new(relay_url: &str, name: &str) -> Self {
        Self {
            relay_url: relay_url.trim_end_matches('/').to_string(),
            instance_name: name.to_string(),
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Load instance configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Instance not initialized. Run 'tunnel-cli init' first.")?;
        serde_json::from_str(&contents).context("Invalid instance configuration")
    }

    /// Save instance configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save instance configuration")?;
        set_file_permissions_0600(&path).await?;
        Ok(())
    }

    /// Check if the instance is initialized.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(CONFIG_FILE).exists()
    }

    /// WebSocket URL of the relay's instance endpoint.
    pub fn instance_endpoint(&self) -> String {
        endpoint(&self.relay_url, "/v1/instance")
    }
}

/// Path of the identity file beside the configuration.
pub fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTITY_FILE)
}

/// Load the instance identity.
pub async fn load_identity(data_dir: &Path) -> Result<Identity> {
    Identity::load(&identity_path(data_dir))
        .await
        .context("Failed to load instance identity")
}

/// Join a relay base URL and an endpoint path.
pub fn endpoint(relay_url: &str, path: &str) -> String {
    format!("{}{}", relay_url.trim_end_matches('/'), path)
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
