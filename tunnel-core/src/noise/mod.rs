//! Noise XX handshake and transport ciphers.
//!
//! Implements `Noise_XX_25519_ChaChaPoly_SHA256`:
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! [`NoiseSession`] is a synchronous state machine over explicit state. It
//! never touches the network; callers move the returned byte strings over
//! whatever transport they have. Once [`NoiseSession::is_complete`] is true,
//! [`NoiseSession::split`] consumes the handshake state and yields a
//! send/receive pair of [`CipherState`]s.
//!
//! # Security Notes
//!
//! - Every failure while reading a handshake message aborts the session. The
//!   same message is never retried.
//! - A remote static key supplied at [`NoiseSession::initialize`] is a pin:
//!   the key revealed by the peer must match it.
//! - Transport nonces are a big-endian 64-bit counter behind four zero bytes.

mod cipher;
mod keys;
mod symmetric;

pub use cipher::{CipherState, KEY_LEN, MAX_NONCE, TAG_LEN};
pub use keys::{Keypair, DH_LEN};
pub use symmetric::HASH_LEN;

use symmetric::SymmetricState;
use thiserror::Error;
use zeroize::Zeroize;
use zerok_tunnel_types::PublicKey;

/// Full protocol name, mixed into the initial transcript.
pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Largest handshake or transport message on the wire.
pub const MAX_MESSAGE_LEN: usize = 65535;

/// Number of messages in the XX pattern.
const XX_MESSAGES: usize = 3;

/// Noise errors.
#[derive(Debug, Error)]
pub enum NoiseError {
    /// Malformed, truncated or out-of-order handshake message.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// AEAD tag mismatch.
    #[error("authentication failed")]
    Authentication,

    /// The peer proved a static key other than the pinned one.
    #[error("remote static key does not match the expected key")]
    RemoteKeyMismatch,

    /// The cipher state has used every nonce; the session must be rebuilt.
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// The cipher state was poisoned by an earlier authentication failure.
    #[error("cipher state aborted")]
    Aborted,

    /// Plaintext exceeds what a single message can carry.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
}

impl NoiseError {
    /// Whether this error ends the session outright.
    ///
    /// Everything except an oversize payload does.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MessageTooLarge(_))
    }
}

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first message (the client).
    Initiator,
    /// Answers the first message (the instance).
    Responder,
}

#[derive(Clone, Copy)]
enum Token {
    Ee,
    Es,
    Se,
}

/// Handshake state for one tunnel session.
pub struct NoiseSession {
    role: Role,
    local_static: Keypair,
    local_ephemeral: Option<Keypair>,
    remote_static: Option<[u8; DH_LEN]>,
    remote_ephemeral: Option<[u8; DH_LEN]>,
    expected_remote_static: Option<[u8; DH_LEN]>,
    symmetric: SymmetricState,
    message_index: usize,
    aborted: bool,
}

impl NoiseSession {
    /// Start a handshake with an empty prologue.
    ///
    /// `remote_static`, when present, pins the key the peer must reveal.
    pub fn initialize(role: Role, local_static: Keypair, remote_static: Option<PublicKey>) -> Self {
        Self::with_prologue(role, local_static, remote_static, &[])
    }

    /// Start a handshake bound to `prologue`. Both sides must use the same
    /// prologue or the second message fails authentication.
    pub fn with_prologue(
        role: Role,
        local_static: Keypair,
        remote_static: Option<PublicKey>,
        prologue: &[u8],
    ) -> Self {
        let mut symmetric = SymmetricState::initialize(PROTOCOL_NAME);
        symmetric.mix_hash(prologue);
        Self {
            role,
            local_static,
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            expected_remote_static: remote_static.map(|k| *k.as_bytes()),
            symmetric,
            message_index: 0,
            aborted: false,
        }
    }

    /// This session's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Index of the next pattern message (0..=3).
    pub fn message_index(&self) -> usize {
        self.message_index
    }

    /// True once all three messages have been processed.
    pub fn is_complete(&self) -> bool {
        self.message_index == XX_MESSAGES
    }

    /// True when the next step is a write for this role.
    pub fn is_my_turn(&self) -> bool {
        !self.is_complete() && (self.message_index % 2 == 0) == (self.role == Role::Initiator)
    }

    /// The peer's static key, once revealed.
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_static.map(PublicKey::new)
    }

    /// Current transcript hash. After completion it identifies the session
    /// and is identical on both peers.
    pub fn handshake_hash(&self) -> [u8; HASH_LEN] {
        self.symmetric.handshake_hash()
    }

    /// Produce the next handshake message carrying `payload`.
    ///
    /// The payload of the first message is sent in the clear; later ones are
    /// encrypted under the handshake key.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.ensure_turn(true)?;
        if payload.len() + 2 * DH_LEN + 2 * TAG_LEN > MAX_MESSAGE_LEN {
            return Err(NoiseError::MessageTooLarge(payload.len()));
        }
        let result = self.write_step(payload);
        self.settle(result)
    }

    /// Consume the peer's next handshake message and return its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.ensure_turn(false)?;
        let result = if message.len() > MAX_MESSAGE_LEN {
            Err(NoiseError::Handshake(format!(
                "message too large: {} bytes",
                message.len()
            )))
        } else {
            self.read_step(message)
        };
        self.settle(result)
    }

    /// Derive the transport ciphers as `(send, receive)`.
    ///
    /// The initiator sends with the first derived key and the responder
    /// with the second, so each side's send cipher matches the other's
    /// receive cipher. The handshake state is dropped (and wiped) here.
    pub fn split(self) -> Result<(CipherState, CipherState), NoiseError> {
        if self.aborted {
            return Err(NoiseError::Handshake("session aborted".into()));
        }
        if !self.is_complete() {
            return Err(NoiseError::Handshake("handshake not complete".into()));
        }
        let (mut k1, mut k2) = self.symmetric.split();
        let ciphers = match self.role {
            Role::Initiator => (CipherState::new(k1), CipherState::new(k2)),
            Role::Responder => (CipherState::new(k2), CipherState::new(k1)),
        };
        k1.zeroize();
        k2.zeroize();
        Ok(ciphers)
    }

    fn ensure_turn(&self, writing: bool) -> Result<(), NoiseError> {
        if self.aborted {
            return Err(NoiseError::Handshake("session aborted".into()));
        }
        if self.is_complete() {
            return Err(NoiseError::Handshake("handshake already complete".into()));
        }
        if self.is_my_turn() != writing {
            return Err(NoiseError::Handshake(format!(
                "out of sequence: {:?} cannot {} message {}",
                self.role,
                if writing { "write" } else { "read" },
                self.message_index
            )));
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T, NoiseError>) -> Result<T, NoiseError> {
        match &result {
            Ok(_) => self.message_index += 1,
            Err(NoiseError::MessageTooLarge(_)) => {}
            Err(_) => self.aborted = true,
        }
        result
    }

    fn write_step(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut out = Vec::with_capacity(2 * DH_LEN + 2 * TAG_LEN + payload.len());
        match self.message_index {
            // -> e
            0 => self.write_ephemeral(&mut out),
            // <- e, ee, s, es
            1 => {
                self.write_ephemeral(&mut out);
                self.mix_dh(Token::Ee)?;
                self.write_static(&mut out)?;
                self.mix_dh(Token::Es)?;
            }
            // -> s, se
            _ => {
                self.write_static(&mut out)?;
                self.mix_dh(Token::Se)?;
            }
        }
        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        Ok(out)
    }

    fn read_step(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut rest = message;
        match self.message_index {
            0 => self.read_ephemeral(&mut rest)?,
            1 => {
                self.read_ephemeral(&mut rest)?;
                self.mix_dh(Token::Ee)?;
                self.read_static(&mut rest)?;
                self.mix_dh(Token::Es)?;
            }
            _ => {
                self.read_static(&mut rest)?;
                self.mix_dh(Token::Se)?;
            }
        }
        if self.symmetric.has_key() && rest.len() < TAG_LEN {
            return Err(NoiseError::Handshake("truncated payload".into()));
        }
        self.symmetric.decrypt_and_hash(rest)
    }

    fn write_ephemeral(&mut self, out: &mut Vec<u8>) {
        let ephemeral = Keypair::generate();
        out.extend_from_slice(ephemeral.public_bytes());
        self.symmetric.mix_hash(ephemeral.public_bytes());
        self.local_ephemeral = Some(ephemeral);
    }

    fn write_static(&mut self, out: &mut Vec<u8>) -> Result<(), NoiseError> {
        let encrypted = self
            .symmetric
            .encrypt_and_hash(self.local_static.public_bytes())?;
        out.extend(encrypted);
        Ok(())
    }

    fn read_ephemeral(&mut self, rest: &mut &[u8]) -> Result<(), NoiseError> {
        let bytes = take(rest, DH_LEN)?;
        let mut key = [0u8; DH_LEN];
        key.copy_from_slice(bytes);
        self.symmetric.mix_hash(&key);
        self.remote_ephemeral = Some(key);
        Ok(())
    }

    fn read_static(&mut self, rest: &mut &[u8]) -> Result<(), NoiseError> {
        let encrypted = take(rest, DH_LEN + TAG_LEN)?;
        let decrypted = self.symmetric.decrypt_and_hash(encrypted)?;
        let mut key = [0u8; DH_LEN];
        key.copy_from_slice(&decrypted);
        if let Some(expected) = self.expected_remote_static {
            if expected != key {
                return Err(NoiseError::RemoteKeyMismatch);
            }
        }
        self.remote_static = Some(key);
        Ok(())
    }

    fn mix_dh(&mut self, token: Token) -> Result<(), NoiseError> {
        let mut shared = self.dh(token)?;
        self.symmetric.mix_key(&shared);
        shared.zeroize();
        Ok(())
    }

    fn dh(&self, token: Token) -> Result<[u8; DH_LEN], NoiseError> {
        let ephemeral = || {
            self.local_ephemeral
                .as_ref()
                .ok_or_else(|| NoiseError::Handshake("missing local ephemeral".into()))
        };
        let remote_e = || {
            self.remote_ephemeral
                .ok_or_else(|| NoiseError::Handshake("missing remote ephemeral".into()))
        };
        let remote_s = || {
            self.remote_static
                .ok_or_else(|| NoiseError::Handshake("missing remote static".into()))
        };

        match (token, self.role) {
            (Token::Ee, _) => ephemeral()?.dh(&remote_e()?),
            (Token::Es, Role::Initiator) => ephemeral()?.dh(&remote_s()?),
            (Token::Es, Role::Responder) => self.local_static.dh(&remote_e()?),
            (Token::Se, Role::Initiator) => self.local_static.dh(&remote_e()?),
            (Token::Se, Role::Responder) => ephemeral()?.dh(&remote_s()?),
        }
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("role", &self.role)
            .field("message_index", &self.message_index)
            .field("remote_static", &self.remote_static())
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

fn take<'a>(rest: &mut &'a [u8], len: usize) -> Result<&'a [u8], NoiseError> {
    if rest.len() < len {
        return Err(NoiseError::Handshake(format!(
            "truncated message: need {len} bytes, have {}",
            rest.len()
        )));
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        initiator: NoiseSession,
        responder: NoiseSession,
        initiator_key: PublicKey,
        responder_key: PublicKey,
    }

    fn fresh_pair() -> Pair {
        let i = Keypair::generate();
        let r = Keypair::generate();
        Pair {
            initiator_key: i.public_key(),
            responder_key: r.public_key(),
            initiator: NoiseSession::initialize(Role::Initiator, i, None),
            responder: NoiseSession::initialize(Role::Responder, r, None),
        }
    }

    fn complete(pair: &mut Pair) {
        let m1 = pair.initiator.write_message(b"").unwrap();
        pair.responder.read_message(&m1).unwrap();
        let m2 = pair.responder.write_message(b"").unwrap();
        pair.initiator.read_message(&m2).unwrap();
        let m3 = pair.initiator.write_message(b"").unwrap();
        pair.responder.read_message(&m3).unwrap();
    }

    // ===========================================
    // Handshake
    // ===========================================

    #[test]
    fn xx_handshake_completes_and_reveals_statics() {
        let mut pair = fresh_pair();
        assert!(!pair.initiator.is_complete());
        complete(&mut pair);

        assert!(pair.initiator.is_complete());
        assert!(pair.responder.is_complete());
        assert_eq!(pair.initiator.remote_static(), Some(pair.responder_key));
        assert_eq!(pair.responder.remote_static(), Some(pair.initiator_key));
        assert_eq!(pair.initiator.handshake_hash(), pair.responder.handshake_hash());
    }

    #[test]
    fn message_sizes_follow_pattern() {
        let mut pair = fresh_pair();
        let m1 = pair.initiator.write_message(b"").unwrap();
        assert_eq!(m1.len(), DH_LEN);
        pair.responder.read_message(&m1).unwrap();
        let m2 = pair.responder.write_message(b"").unwrap();
        assert_eq!(m2.len(), DH_LEN + DH_LEN + TAG_LEN + TAG_LEN);
        pair.initiator.read_message(&m2).unwrap();
        let m3 = pair.initiator.write_message(b"").unwrap();
        assert_eq!(m3.len(), DH_LEN + TAG_LEN + TAG_LEN);
    }

    #[test]
    fn handshake_payloads_are_delivered() {
        let mut pair = fresh_pair();
        let m1 = pair.initiator.write_message(b"hello").unwrap();
        assert_eq!(pair.responder.read_message(&m1).unwrap(), b"hello");
        let m2 = pair.responder.write_message(b"from responder").unwrap();
        assert_eq!(pair.initiator.read_message(&m2).unwrap(), b"from responder");
        let m3 = pair.initiator.write_message(b"device info").unwrap();
        assert!(!m3.windows(11).any(|w| w == b"device info"));
        assert_eq!(pair.responder.read_message(&m3).unwrap(), b"device info");
    }

    #[test]
    fn write_after_completion_fails() {
        let mut pair = fresh_pair();
        complete(&mut pair);
        assert!(matches!(
            pair.initiator.write_message(b""),
            Err(NoiseError::Handshake(_))
        ));
        assert!(matches!(
            pair.responder.read_message(&[0u8; 64]),
            Err(NoiseError::Handshake(_))
        ));
    }

    #[test]
    fn out_of_sequence_calls_fail_without_aborting() {
        let mut pair = fresh_pair();
        assert!(matches!(
            pair.responder.write_message(b""),
            Err(NoiseError::Handshake(_))
        ));
        assert!(matches!(
            pair.initiator.read_message(&[0u8; 32]),
            Err(NoiseError::Handshake(_))
        ));
        // Misuse did not poison the sessions
        complete(&mut pair);
        assert!(pair.initiator.is_complete());
    }

    #[test]
    fn truncated_message_aborts() {
        let mut pair = fresh_pair();
        let m1 = pair.initiator.write_message(b"").unwrap();
        assert!(matches!(
            pair.responder.read_message(&m1[..10]),
            Err(NoiseError::Handshake(_))
        ));
        // The same (now correct) message is never accepted afterwards
        assert!(matches!(
            pair.responder.read_message(&m1),
            Err(NoiseError::Handshake(_))
        ));
    }

    #[test]
    fn tampered_second_message_fails_authentication() {
        let mut pair = fresh_pair();
        let m1 = pair.initiator.write_message(b"").unwrap();
        pair.responder.read_message(&m1).unwrap();
        let mut m2 = pair.responder.write_message(b"").unwrap();
        m2[DH_LEN + 3] ^= 0x01;

        assert!(matches!(
            pair.initiator.read_message(&m2),
            Err(NoiseError::Authentication)
        ));
        assert!(matches!(
            pair.initiator.write_message(b""),
            Err(NoiseError::Handshake(_))
        ));
    }

    #[test]
    fn tampered_third_message_fails_authentication() {
        let mut pair = fresh_pair();
        let m1 = pair.initiator.write_message(b"").unwrap();
        pair.responder.read_message(&m1).unwrap();
        let m2 = pair.responder.write_message(b"").unwrap();
        pair.initiator.read_message(&m2).unwrap();
        let mut m3 = pair.initiator.write_message(b"payload").unwrap();
        let last = m3.len() - 1;
        m3[last] ^= 0x80;

        assert!(matches!(
            pair.responder.read_message(&m3),
            Err(NoiseError::Authentication)
        ));
        assert!(!pair.responder.is_complete());
    }

    #[test]
    fn pinned_keys_accept_the_right_peer() {
        let i = Keypair::generate();
        let r = Keypair::generate();
        let mut pair = Pair {
            initiator_key: i.public_key(),
            responder_key: r.public_key(),
            initiator: NoiseSession::initialize(Role::Initiator, i.clone(), Some(r.public_key())),
            responder: NoiseSession::initialize(Role::Responder, r, Some(i.public_key())),
        };
        complete(&mut pair);
        assert!(pair.responder.is_complete());
    }

    #[test]
    fn pinned_key_mismatch_is_rejected() {
        let impostor = Keypair::generate();
        let i = Keypair::generate();
        let r = Keypair::generate();
        let mut initiator = NoiseSession::initialize(Role::Initiator, i, Some(impostor.public_key()));
        let mut responder = NoiseSession::initialize(Role::Responder, r, None);

        let m1 = initiator.write_message(b"").unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message(b"").unwrap();
        assert!(matches!(
            initiator.read_message(&m2),
            Err(NoiseError::RemoteKeyMismatch)
        ));
    }

    #[test]
    fn responder_pin_checks_client_key() {
        let i = Keypair::generate();
        let r = Keypair::generate();
        let mut initiator = NoiseSession::initialize(Role::Initiator, i, None);
        let mut responder =
            NoiseSession::initialize(Role::Responder, r, Some(Keypair::generate().public_key()));

        let m1 = initiator.write_message(b"").unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message(b"").unwrap();
        initiator.read_message(&m2).unwrap();
        let m3 = initiator.write_message(b"").unwrap();
        assert!(matches!(
            responder.read_message(&m3),
            Err(NoiseError::RemoteKeyMismatch)
        ));
    }

    #[test]
    fn prologue_mismatch_fails() {
        let mut initiator =
            NoiseSession::with_prologue(Role::Initiator, Keypair::generate(), None, b"v1");
        let mut responder =
            NoiseSession::with_prologue(Role::Responder, Keypair::generate(), None, b"v2");

        let m1 = initiator.write_message(b"").unwrap();
        responder.read_message(&m1).unwrap();
        let m2 = responder.write_message(b"").unwrap();
        assert!(matches!(
            initiator.read_message(&m2),
            Err(NoiseError::Authentication)
        ));
    }

    #[test]
    fn oversize_payload_is_rejected_without_abort() {
        let mut pair = fresh_pair();
        let big = vec![0u8; MAX_MESSAGE_LEN];
        assert!(matches!(
            pair.initiator.write_message(&big),
            Err(NoiseError::MessageTooLarge(_))
        ));
        complete(&mut pair);
    }

    // ===========================================
    // Split and transport
    // ===========================================

    #[test]
    fn split_before_completion_fails() {
        let pair = fresh_pair();
        assert!(pair.initiator.split().is_err());
    }

    #[test]
    fn split_ciphers_interoperate_both_ways() {
        let mut pair = fresh_pair();
        complete(&mut pair);
        let (mut i_send, mut i_recv) = pair.initiator.split().unwrap();
        let (mut r_send, mut r_recv) = pair.responder.split().unwrap();

        for n in 0..3 {
            let msg = format!("client message {n}");
            let ct = i_send.encrypt_with_ad(b"sid", msg.as_bytes()).unwrap();
            assert_eq!(r_recv.decrypt_with_ad(b"sid", &ct).unwrap(), msg.as_bytes());

            let reply = format!("instance reply {n}");
            let ct = r_send.encrypt_with_ad(b"sid", reply.as_bytes()).unwrap();
            assert_eq!(i_recv.decrypt_with_ad(b"sid", &ct).unwrap(), reply.as_bytes());
        }
        assert_eq!(i_send.nonce(), 3);
        assert_eq!(i_recv.nonce(), 3);
    }

    #[test]
    fn directions_use_independent_keys() {
        let mut pair = fresh_pair();
        complete(&mut pair);
        let (mut i_send, mut i_recv) = pair.initiator.split().unwrap();

        // A side cannot read its own outbound traffic
        let ct = i_send.encrypt_with_ad(&[], b"x").unwrap();
        assert!(matches!(
            i_recv.decrypt_with_ad(&[], &ct),
            Err(NoiseError::Authentication)
        ));
    }

    #[test]
    fn separate_sessions_produce_different_ciphertext() {
        let mut a = fresh_pair();
        let mut b = fresh_pair();
        complete(&mut a);
        complete(&mut b);
        let (mut a_send, _) = a.initiator.split().unwrap();
        let (mut b_send, _) = b.initiator.split().unwrap();
        assert_ne!(
            a_send.encrypt_with_ad(&[], b"same message").unwrap(),
            b_send.encrypt_with_ad(&[], b"same message").unwrap()
        );
    }

    #[test]
    fn aborted_session_cannot_split() {
        let mut pair = fresh_pair();
        let m1 = pair.initiator.write_message(b"").unwrap();
        let _ = pair.responder.read_message(&m1[..5]);
        assert!(pair.responder.split().is_err());
    }

    #[test]
    fn error_fatality() {
        assert!(NoiseError::Authentication.is_fatal());
        assert!(NoiseError::NonceExhausted.is_fatal());
        assert!(!NoiseError::MessageTooLarge(1).is_fatal());
    }
}
