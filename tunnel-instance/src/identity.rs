//! Persistent instance identity.
//!
//! An instance keeps the same id and static key across restarts, because
//! the relay binds a registration to the first key it saw for an id.
//! Stored as JSON with the secret hex-encoded; the file is created
//! owner-only on unix.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use zerok_tunnel_core::Keypair;
use zerok_tunnel_types::{InstanceId, PublicKey};
use zeroize::Zeroizing;

/// Identity file errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the file failed.
    #[error("identity file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a valid identity.
    #[error("invalid identity file: {0}")]
    Invalid(String),
}

/// An instance's id and static key.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Relay routing id.
    pub instance_id: InstanceId,
    /// Noise static key.
    pub keypair: Keypair,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    instance_id: InstanceId,
    secret_key: String,
}

impl Identity {
    /// Fresh random identity.
    pub fn generate() -> Self {
        Self {
            instance_id: InstanceId::new(),
            keypair: Keypair::generate(),
        }
    }

    /// Public half of the static key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Load an identity from `path`.
    pub async fn load(path: &Path) -> Result<Self, IdentityError> {
        let contents = Zeroizing::new(tokio::fs::read_to_string(path).await?);
        let file: IdentityFile =
            serde_json::from_str(&contents).map_err(|e| IdentityError::Invalid(e.to_string()))?;

        let secret = Zeroizing::new(
            hex::decode(&file.secret_key).map_err(|e| IdentityError::Invalid(e.to_string()))?,
        );
        let bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Invalid(format!("secret key is {} bytes", secret.len())))?;

        Ok(Self {
            instance_id: file.instance_id,
            keypair: Keypair::from_secret_bytes(bytes),
        })
    }

    /// Write the identity to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = IdentityFile {
            instance_id: self.instance_id,
            secret_key: hex::encode(self.keypair.secret_bytes()),
        };
        let contents = Zeroizing::new(
            serde_json::to_string_pretty(&file).map_err(|e| IdentityError::Invalid(e.to_string()))?,
        );
        let mut secret = file.secret_key;
        zeroize::Zeroize::zeroize(&mut secret);

        tokio::fs::write(path, contents.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Load `path`, or generate and save a new identity if it is missing.
    pub async fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match Self::load(path).await {
            Ok(identity) => Ok(identity),
            Err(IdentityError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path).await?;
                tracing::info!(instance = %identity.instance_id, path = %path.display(), "Created instance identity");
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }
}
