//! Transport cipher state: one key plus a 64-bit nonce counter.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::NoiseError;

/// Symmetric key size (256 bits).
pub const KEY_LEN: usize = 32;

/// Poly1305 tag size appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Reserved counter value. Only [`CipherState::rekey`] may use it.
pub const MAX_NONCE: u64 = u64::MAX;

/// One direction of an established session.
///
/// The counter starts at zero and advances once per successful
/// operation. A tag mismatch on decrypt aborts the state for good.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    key: [u8; KEY_LEN],
    nonce: u64,
    aborted: bool,
}

impl CipherState {
    /// Wrap a freshly derived key.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            nonce: 0,
            aborted: false,
        }
    }

    /// Counter value the next operation will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Whether a failed decrypt has poisoned this state.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Encrypt `plaintext`, binding `ad`.
    ///
    /// # Errors
    ///
    /// - [`NoiseError::NonceExhausted`] once the counter reaches `2^64 - 1`
    /// - [`NoiseError::Aborted`] after an earlier authentication failure
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.ensure_usable()?;
        let ciphertext = seal(&self.key, self.nonce, ad, plaintext)?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    /// Decrypt and authenticate `ciphertext` against `ad`.
    ///
    /// A tag mismatch returns [`NoiseError::Authentication`] and aborts the
    /// state; the counter is not advanced.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.ensure_usable()?;
        match open(&self.key, self.nonce, ad, ciphertext) {
            Ok(plaintext) => {
                self.nonce += 1;
                Ok(plaintext)
            }
            Err(e) => {
                self.aborted = true;
                Err(e)
            }
        }
    }

    /// Rotate the key in place.
    ///
    /// The new key is the first 32 bytes of encrypting 32 zero bytes under
    /// the current key at the reserved nonce. The counter resets to zero.
    /// Both peers must rekey at the same point in the stream.
    pub fn rekey(&mut self) -> Result<(), NoiseError> {
        if self.aborted {
            return Err(NoiseError::Aborted);
        }
        let mut output = seal(&self.key, MAX_NONCE, &[], &[0u8; KEY_LEN])?;
        self.key.copy_from_slice(&output[..KEY_LEN]);
        output.zeroize();
        self.nonce = 0;
        Ok(())
    }

    fn ensure_usable(&self) -> Result<(), NoiseError> {
        if self.aborted {
            return Err(NoiseError::Aborted);
        }
        if self.nonce == MAX_NONCE {
            return Err(NoiseError::NonceExhausted);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("key", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .field("aborted", &self.aborted)
            .finish()
    }
}

/// 96-bit AEAD nonce: 4 zero bytes then the big-endian counter.
pub(crate) fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn seal(key: &[u8; KEY_LEN], counter: u64, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_bytes(counter);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| NoiseError::MessageTooLarge(plaintext.len()))
}

fn open(key: &[u8; KEY_LEN], counter: u64, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_bytes(counter);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| NoiseError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CipherState, CipherState) {
        (CipherState::new([42u8; KEY_LEN]), CipherState::new([42u8; KEY_LEN]))
    }

    #[test]
    fn nonce_layout_is_big_endian_counter() {
        assert_eq!(nonce_bytes(0), [0u8; 12]);
        assert_eq!(nonce_bytes(1), [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(nonce_bytes(0x0102), [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn roundtrip_advances_both_counters() {
        let (mut tx, mut rx) = pair();
        for i in 0..5u64 {
            assert_eq!(tx.nonce(), i);
            let ct = tx.encrypt_with_ad(b"ad", b"hello").unwrap();
            assert_eq!(ct.len(), 5 + TAG_LEN);
            assert_eq!(rx.decrypt_with_ad(b"ad", &ct).unwrap(), b"hello");
            assert_eq!(rx.nonce(), i + 1);
        }
    }

    #[test]
    fn same_plaintext_never_repeats_ciphertext() {
        let (mut tx, _) = pair();
        let a = tx.encrypt_with_ad(&[], b"same").unwrap();
        let b = tx.encrypt_with_ad(&[], b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_ad_fails_and_aborts() {
        let (mut tx, mut rx) = pair();
        let ct = tx.encrypt_with_ad(b"one", b"data").unwrap();
        assert!(matches!(
            rx.decrypt_with_ad(b"two", &ct),
            Err(NoiseError::Authentication)
        ));
        assert!(rx.is_aborted());
        assert_eq!(rx.nonce(), 0);

        // Not retried, even with the right AD
        assert!(matches!(
            rx.decrypt_with_ad(b"one", &ct),
            Err(NoiseError::Aborted)
        ));
        assert!(matches!(rx.rekey(), Err(NoiseError::Aborted)));
    }

    #[test]
    fn encrypt_rejected_at_max_nonce() {
        let (mut tx, _) = pair();
        tx.set_nonce(MAX_NONCE - 1);
        assert!(tx.encrypt_with_ad(&[], b"last").is_ok());
        assert_eq!(tx.nonce(), MAX_NONCE);
        assert!(matches!(
            tx.encrypt_with_ad(&[], b"wrap"),
            Err(NoiseError::NonceExhausted)
        ));
        // No wraparound happened
        assert_eq!(tx.nonce(), MAX_NONCE);
    }

    #[test]
    fn decrypt_rejected_at_max_nonce() {
        let (_, mut rx) = pair();
        rx.set_nonce(MAX_NONCE);
        assert!(matches!(
            rx.decrypt_with_ad(&[], &[0u8; TAG_LEN]),
            Err(NoiseError::NonceExhausted)
        ));
        assert!(!rx.is_aborted());
    }

    #[test]
    fn rekey_in_lockstep_keeps_stream_readable() {
        let (mut tx, mut rx) = pair();
        let ct = tx.encrypt_with_ad(&[], b"before").unwrap();
        rx.decrypt_with_ad(&[], &ct).unwrap();

        tx.rekey().unwrap();
        rx.rekey().unwrap();
        assert_eq!(tx.nonce(), 0);

        let ct = tx.encrypt_with_ad(&[], b"after").unwrap();
        assert_eq!(rx.decrypt_with_ad(&[], &ct).unwrap(), b"after");
    }

    #[test]
    fn rekey_on_one_side_breaks_stream() {
        let (mut tx, mut rx) = pair();
        tx.rekey().unwrap();
        let ct = tx.encrypt_with_ad(&[], b"lost").unwrap();
        assert!(rx.decrypt_with_ad(&[], &ct).is_err());
    }

    #[test]
    fn rekey_changes_key() {
        let (mut a, mut b) = pair();
        a.rekey().unwrap();
        let ct_rekeyed = a.encrypt_with_ad(&[], b"x").unwrap();
        let ct_original = b.encrypt_with_ad(&[], b"x").unwrap();
        assert_ne!(ct_rekeyed, ct_original);
    }

    #[test]
    fn debug_is_redacted() {
        let (tx, _) = pair();
        let debug = format!("{:?}", tx);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }
}
