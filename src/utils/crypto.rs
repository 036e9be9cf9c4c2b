//! # Session Cryptography
//!
//! AES-128-CCM (4-byte tag, 12-byte nonce) keyed per direction by the
//! handshake.
//!
//! ## Nonce layout
//! ```text
//! bytes[0..4]   = direction nonce base
//! bytes[4..8]   = 0
//! bytes[8..10]  = counter, u16 LE
//! bytes[10..12] = 0
//! ```
//!
//! ## Sealed message layout
//! ```text
//! [counter: u16 LE] [ciphertext || tag(4)]
//! ```
//!
//! The counter prefix lets the receiver rebuild the nonce without tracking
//! the sender's position, so messages on different channels may arrive in
//! any order. Counters are never reused: exhausting the 16-bit space is an
//! error, never a wrap.

use aes::Aes128;
use bytes::{BufMut, Bytes, BytesMut};
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U12, U4};
use ccm::Ccm;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::replay_cache::ReplayCache;

/// AES-128-CCM with a 4-byte tag and 12-byte nonce
type Aes128Ccm = Ccm<Aes128, U4, U12>;

pub const KEY_LEN: usize = 16;
pub const NONCE_BASE_LEN: usize = 4;
pub const TAG_LEN: usize = 4;
pub const COUNTER_LEN: usize = 2;

/// Bytes a sealed message adds to its plaintext
pub const SEAL_OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

/// 12-byte CCM nonce built from a direction base and a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionNonce([u8; 12]);

impl SessionNonce {
    pub fn new(base: &[u8; NONCE_BASE_LEN], counter: u16) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(base);
        bytes[8..10].copy_from_slice(&counter.to_le_bytes());
        SessionNonce(bytes)
    }

    pub fn counter(&self) -> u16 {
        u16::from_le_bytes([self.0[8], self.0[9]])
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Per-direction key material from the local endpoint's point of view.
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub encrypt_key: [u8; KEY_LEN],
    pub decrypt_key: [u8; KEY_LEN],
    pub encrypt_nonce_base: [u8; NONCE_BASE_LEN],
    pub decrypt_nonce_base: [u8; NONCE_BASE_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

struct SealDirection {
    cipher: Aes128Ccm,
    nonce_base: [u8; NONCE_BASE_LEN],
    /// Next counter to use; `u16::MAX + 1` once exhausted
    next_counter: u32,
}

struct OpenDirection {
    cipher: Aes128Ccm,
    nonce_base: [u8; NONCE_BASE_LEN],
    replay: ReplayCache,
}

/// Encrypt/decrypt state for one established session
pub struct SessionCipher {
    seal: SealDirection,
    open: OpenDirection,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("next_counter", &self.seal.next_counter)
            .field("replay", &self.open.replay)
            .finish()
    }
}

impl SessionCipher {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            seal: SealDirection {
                cipher: Aes128Ccm::new((&keys.encrypt_key).into()),
                nonce_base: keys.encrypt_nonce_base,
                next_counter: 0,
            },
            open: OpenDirection {
                cipher: Aes128Ccm::new((&keys.decrypt_key).into()),
                nonce_base: keys.decrypt_nonce_base,
                replay: ReplayCache::new(),
            },
        }
    }

    /// Counter the next `seal` will use, or `None` once exhausted
    pub fn next_counter(&self) -> Option<u16> {
        u16::try_from(self.seal.next_counter).ok()
    }

    /// Encrypt `plaintext` under the next counter of the send direction
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        let counter = self.next_counter().ok_or(ProtocolError::NonceExhausted)?;
        self.seal.next_counter += 1;

        let nonce = SessionNonce::new(&self.seal.nonce_base, counter);
        let ciphertext = self
            .seal
            .cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| ProtocolError::Integrity(constants::ERR_ENCRYPTION_FAILED))?;

        let mut sealed = BytesMut::with_capacity(COUNTER_LEN + ciphertext.len());
        sealed.put_u16_le(counter);
        sealed.put_slice(&ciphertext);

        global_metrics().encryption();
        trace!(counter, len = plaintext.len(), "sealed message");
        Ok(sealed.freeze())
    }

    /// Verify and decrypt a sealed message from the receive direction
    pub fn open(&mut self, sealed: &[u8]) -> Result<Bytes> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(ProtocolError::Integrity(constants::ERR_SEALED_TOO_SHORT));
        }

        let counter = u16::from_le_bytes([sealed[0], sealed[1]]);
        if self.open.replay.contains(counter) {
            debug!(counter, "rejecting replayed counter");
            return Err(ProtocolError::Integrity(constants::ERR_COUNTER_REPLAYED));
        }

        let nonce = SessionNonce::new(&self.open.nonce_base, counter);
        let plaintext = self
            .open
            .cipher
            .decrypt(nonce.as_bytes().into(), &sealed[COUNTER_LEN..])
            .map_err(|_| ProtocolError::Integrity(constants::ERR_TAG_VERIFICATION))?;

        // authenticated, so the counter is now spent
        self.open.replay.record(counter);
        trace!(counter, len = plaintext.len(), "opened message");
        Ok(Bytes::from(plaintext))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keys_pair() -> (SessionKeys, SessionKeys) {
        let a = SessionKeys {
            encrypt_key: [0x11; KEY_LEN],
            decrypt_key: [0x22; KEY_LEN],
            encrypt_nonce_base: [1, 2, 3, 4],
            decrypt_nonce_base: [5, 6, 7, 8],
        };
        let b = SessionKeys {
            encrypt_key: a.decrypt_key,
            decrypt_key: a.encrypt_key,
            encrypt_nonce_base: a.decrypt_nonce_base,
            decrypt_nonce_base: a.encrypt_nonce_base,
        };
        (a, b)
    }

    #[test]
    fn nonce_layout() {
        let nonce = SessionNonce::new(&[0xAA, 0xBB, 0xCC, 0xDD], 0x0102);
        assert_eq!(
            nonce.as_bytes(),
            &[0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 0, 0x02, 0x01, 0, 0]
        );
        assert_eq!(nonce.counter(), 0x0102);
    }

    #[test]
    fn seal_open_between_peers() {
        let (a, b) = keys_pair();
        let mut alice = SessionCipher::new(&a);
        let mut bob = SessionCipher::new(&b);

        let sealed = alice.seal(b"hello band").unwrap();
        assert_eq!(sealed.len(), b"hello band".len() + SEAL_OVERHEAD);
        assert_eq!(&bob.open(&sealed).unwrap()[..], b"hello band");
    }

    #[test]
    fn counters_strictly_increase() {
        let (a, _) = keys_pair();
        let mut alice = SessionCipher::new(&a);
        let mut last = None;
        for _ in 0..50 {
            let sealed = alice.seal(b"x").unwrap();
            let counter = u16::from_le_bytes([sealed[0], sealed[1]]);
            if let Some(prev) = last {
                assert!(counter > prev);
            }
            last = Some(counter);
        }
    }

    #[test]
    fn replayed_message_is_integrity_error() {
        let (a, b) = keys_pair();
        let mut alice = SessionCipher::new(&a);
        let mut bob = SessionCipher::new(&b);

        let sealed = alice.seal(b"once").unwrap();
        bob.open(&sealed).unwrap();
        assert!(matches!(
            bob.open(&sealed),
            Err(ProtocolError::Integrity(constants::ERR_COUNTER_REPLAYED))
        ));
    }

    #[test]
    fn tampered_message_does_not_burn_counter() {
        let (a, b) = keys_pair();
        let mut alice = SessionCipher::new(&a);
        let mut bob = SessionCipher::new(&b);

        let sealed = alice.seal(b"payload").unwrap();
        let mut forged = sealed.to_vec();
        forged[3] ^= 0x40;
        assert!(matches!(
            bob.open(&forged),
            Err(ProtocolError::Integrity(constants::ERR_TAG_VERIFICATION))
        ));
        assert_eq!(&bob.open(&sealed).unwrap()[..], b"payload");
    }

    #[test]
    fn exhaustion_is_an_error_not_a_wrap() {
        let (a, _) = keys_pair();
        let mut alice = SessionCipher::new(&a);
        alice.seal.next_counter = u16::MAX as u32;
        alice.seal(b"last").unwrap();
        assert_eq!(alice.next_counter(), None);
        assert!(matches!(alice.seal(b"more"), Err(ProtocolError::NonceExhausted)));
    }
}
