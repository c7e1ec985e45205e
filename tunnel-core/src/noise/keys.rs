//! X25519 key pairs.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as DhPublic, StaticSecret};
use zerok_tunnel_types::PublicKey;

use super::NoiseError;

/// Length of a DH public key and of a DH output.
pub const DH_LEN: usize = 32;

/// An X25519 key pair, used both for static identities and ephemerals.
///
/// The secret half is wiped on drop.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: DhPublic,
}

impl Keypair {
    /// Generate a key pair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; DH_LEN]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = DhPublic::from(&secret);
        Self { secret, public }
    }

    /// Secret bytes, for persisting an identity. Handle with care.
    pub fn secret_bytes(&self) -> [u8; DH_LEN] {
        self.secret.to_bytes()
    }

    /// The public half as a wire type.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.public.to_bytes())
    }

    pub(crate) fn public_bytes(&self) -> &[u8; DH_LEN] {
        self.public.as_bytes()
    }

    /// X25519 with a remote public key.
    ///
    /// Rejects low-order points, whose output would be all zeros.
    pub(crate) fn dh(&self, remote: &[u8; DH_LEN]) -> Result<[u8; DH_LEN], NoiseError> {
        let shared = self.secret.diffie_hellman(&DhPublic::from(*remote));
        if !shared.was_contributory() {
            return Err(NoiseError::Handshake("non-contributory DH output".into()));
        }
        Ok(*shared.as_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair {{ public: {:?}, secret: [REDACTED] }}", self.public_key())
    }
}
