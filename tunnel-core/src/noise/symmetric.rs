//! Chaining key and transcript hash shared by both handshake roles.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::cipher::{CipherState, KEY_LEN};
use super::NoiseError;

/// SHA-256 output length.
pub const HASH_LEN: usize = 32;

#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SymmetricState {
    ck: [u8; HASH_LEN],
    h: [u8; HASH_LEN],
    cipher: Option<CipherState>,
}

impl SymmetricState {
    pub(crate) fn initialize(protocol_name: &[u8]) -> Self {
        let mut h = [0u8; HASH_LEN];
        if protocol_name.len() <= HASH_LEN {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            h.copy_from_slice(&Sha256::digest(protocol_name));
        }
        Self {
            ck: h,
            h,
            cipher: None,
        }
    }

    pub(crate) fn handshake_hash(&self) -> [u8; HASH_LEN] {
        self.h
    }

    pub(crate) fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    pub(crate) fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    pub(crate) fn mix_key(&mut self, input_key_material: &[u8]) {
        let (ck, mut temp_k) = hkdf2(&self.ck, input_key_material);
        self.ck = ck;
        self.cipher = Some(CipherState::new(temp_k));
        temp_k.zeroize();
    }

    pub(crate) fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = match &mut self.cipher {
            Some(cipher) => cipher.encrypt_with_ad(&self.h, plaintext)?,
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub(crate) fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = match &mut self.cipher {
            Some(cipher) => cipher.decrypt_with_ad(&self.h, ciphertext)?,
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Final key pair: first for initiator-to-responder traffic.
    pub(crate) fn split(&self) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
        hkdf2(&self.ck, &[])
    }
}

/// Noise HKDF with two outputs. RFC 5869 with `ck` as salt and empty info
/// yields exactly the Noise construction.
fn hkdf2(chaining_key: &[u8; HASH_LEN], input_key_material: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), input_key_material);
    let mut okm = [0u8; 64];
    // 64 <= 255 * 32, so expand cannot fail
    hk.expand(&[], &mut okm)
        .expect("64 bytes is within the HKDF-SHA256 output limit");

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (first, second)
}
