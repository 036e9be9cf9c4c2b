//! Pre-shared-secret handshake with HMAC-SHA256 key derivation
//!
//! Three messages establish per-direction AES-CCM keys from a 16-byte secret
//! `S` and two fresh 16-byte nonces:
//!
//! 1. initiator -> responder: `Na`
//! 2. responder -> initiator: `Nb`, `HMAC(Kb, Nb || Na)`
//! 3. initiator -> responder: `HMAC(Ke, Na || Nb)`, sealed device info
//!
//! The 64-byte key block is `T(1) || T(2)` where
//! `K0 = HMAC(Na || Nb, S)` and `T(i) = HMAC(K0, T(i-1) || "miwear-auth" || i)`.
//! From the initiator's view it splits into decryption key (0..16),
//! encryption key (16..32), decryption nonce base (32..36) and encryption
//! nonce base (36..40); the responder uses the same block swapped.
//!
//! Handshake state is per session: each flow step consumes the previous
//! step's state, so a connection can never mix two exchanges.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::credentials::SECRET_LEN;
use crate::protocol::message::{DeviceInfo, HandshakeMessage};
use crate::protocol::session::Role;
use crate::utils::crypto::{SessionCipher, SessionKeys, KEY_LEN, NONCE_BASE_LEN};
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 16;
pub const KEY_BLOCK_LEN: usize = 64;
pub const TAG_LEN: usize = 32;

const AUTH_LABEL: &[u8] = b"miwear-auth";

/// Initiator-side handshake state - passed through the handshake flow
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct InitiatorHandshakeState {
    nonce: [u8; NONCE_LEN],
}

impl InitiatorHandshakeState {
    /// Get reference to the initiator nonce (for testing)
    #[cfg(test)]
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }
}

/// Responder-side handshake state - passed through the handshake flow
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ResponderHandshakeState {
    initiator_nonce: [u8; NONCE_LEN],
    responder_nonce: [u8; NONCE_LEN],
    keys: SessionKeys,
}

/// Generate a cryptographically secure random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce)
        .map_err(|_| ProtocolError::Session(constants::ERR_RANDOM_UNAVAILABLE))?;
    Ok(nonce)
}

fn mac_with_key(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ProtocolError::Session(constants::ERR_KEYS_NOT_DERIVED))
}

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; TAG_LEN]> {
    let mut mac = mac_with_key(key)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn verify_tag(key: &[u8], parts: &[&[u8]], tag: &[u8], failure: &'static str) -> Result<()> {
    let mut mac = mac_with_key(key)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag)
        .map_err(|_| ProtocolError::AuthenticationFailed(failure))
}

/// Derive the 64-byte key block from the secret and both nonces
pub fn derive_key_block(
    secret: &[u8; SECRET_LEN],
    initiator_nonce: &[u8; NONCE_LEN],
    responder_nonce: &[u8; NONCE_LEN],
) -> Result<Zeroizing<[u8; KEY_BLOCK_LEN]>> {
    let mut nonces = Zeroizing::new([0u8; NONCE_LEN * 2]);
    nonces[..NONCE_LEN].copy_from_slice(initiator_nonce);
    nonces[NONCE_LEN..].copy_from_slice(responder_nonce);

    let prk = Zeroizing::new(hmac_sha256(&nonces[..], &[secret])?);

    let mut block = Zeroizing::new([0u8; KEY_BLOCK_LEN]);
    let mut previous: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::new());
    let mut filled = 0;
    let mut counter: u8 = 1;
    while filled < KEY_BLOCK_LEN {
        let t = hmac_sha256(&prk[..], &[&previous, AUTH_LABEL, &[counter]])?;
        let take = (KEY_BLOCK_LEN - filled).min(t.len());
        block[filled..filled + take].copy_from_slice(&t[..take]);
        filled += take;
        previous.clear();
        previous.extend_from_slice(&t);
        counter += 1;
    }

    Ok(block)
}

/// Split the key block into keys for `role`
pub fn session_keys(block: &[u8; KEY_BLOCK_LEN], role: Role) -> SessionKeys {
    let mut first_key = [0u8; KEY_LEN];
    let mut second_key = [0u8; KEY_LEN];
    let mut first_base = [0u8; NONCE_BASE_LEN];
    let mut second_base = [0u8; NONCE_BASE_LEN];
    first_key.copy_from_slice(&block[0..16]);
    second_key.copy_from_slice(&block[16..32]);
    first_base.copy_from_slice(&block[32..36]);
    second_base.copy_from_slice(&block[36..40]);

    let keys = match role {
        Role::Initiator => SessionKeys {
            decrypt_key: first_key,
            encrypt_key: second_key,
            decrypt_nonce_base: first_base,
            encrypt_nonce_base: second_base,
        },
        Role::Responder => SessionKeys {
            encrypt_key: first_key,
            decrypt_key: second_key,
            encrypt_nonce_base: first_base,
            decrypt_nonce_base: second_base,
        },
    };

    first_key.zeroize();
    second_key.zeroize();
    keys
}

/// Starts the handshake from the initiator side.
///
/// # Returns
/// A tuple of (new `InitiatorHandshakeState`, `HandshakeMessage::Nonce`)
#[instrument]
pub fn initiator_handshake_init() -> Result<(InitiatorHandshakeState, HandshakeMessage)> {
    let nonce = generate_nonce()?;
    debug!("Initiator starting handshake");
    Ok((
        InitiatorHandshakeState { nonce },
        HandshakeMessage::Nonce { nonce },
    ))
}

/// Responder answers the initiator nonce with its own nonce and step-2 tag.
///
/// # Returns
/// A tuple of (new `ResponderHandshakeState`, `HandshakeMessage::NonceReply`)
#[instrument(skip(secret, initiator_nonce))]
pub fn responder_handshake_response(
    secret: &[u8; SECRET_LEN],
    initiator_nonce: [u8; NONCE_LEN],
) -> Result<(ResponderHandshakeState, HandshakeMessage)> {
    let responder_nonce = generate_nonce()?;
    let block = derive_key_block(secret, &initiator_nonce, &responder_nonce)?;
    let keys = session_keys(&block, Role::Responder);

    // Kb is the initiator's decryption key, which is our encryption key
    let tag = hmac_sha256(&keys.encrypt_key, &[&responder_nonce, &initiator_nonce])?;

    debug!("Responder answering handshake");
    Ok((
        ResponderHandshakeState {
            initiator_nonce,
            responder_nonce,
            keys,
        },
        HandshakeMessage::NonceReply {
            nonce: responder_nonce,
            tag,
        },
    ))
}

/// Initiator verifies the step-2 tag and produces the confirmation.
///
/// The returned cipher has already spent counter 0 on the sealed device info.
///
/// # Errors
/// Returns `ProtocolError::AuthenticationFailed` if the responder's tag does
/// not match (wrong secret or tampered nonce)
#[instrument(skip_all)]
pub fn initiator_handshake_verify(
    state: InitiatorHandshakeState,
    secret: &[u8; SECRET_LEN],
    responder_nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    info: &DeviceInfo,
) -> Result<(SessionCipher, HandshakeMessage)> {
    let block = derive_key_block(secret, &state.nonce, &responder_nonce)?;
    let keys = session_keys(&block, Role::Initiator);

    verify_tag(
        &keys.decrypt_key,
        &[&responder_nonce, &state.nonce],
        &tag,
        constants::ERR_HANDSHAKE_TAG_MISMATCH,
    )?;

    let confirmation = hmac_sha256(&keys.encrypt_key, &[&state.nonce, &responder_nonce])?;

    let mut cipher = SessionCipher::new(&keys);
    let encoded = Zeroizing::new(bincode::serialize(info)?);
    let sealed_info = cipher.seal(&encoded)?.to_vec();

    debug!("Initiator verified responder");
    Ok((
        cipher,
        HandshakeMessage::Confirm {
            tag: confirmation,
            sealed_info,
        },
    ))
}

/// Responder verifies the confirmation tag and opens the device info.
///
/// # Errors
/// Returns `ProtocolError::AuthenticationFailed` if the confirmation does not
/// verify or the device info cannot be opened
#[instrument(skip_all)]
pub fn responder_handshake_finalize(
    state: ResponderHandshakeState,
    tag: [u8; TAG_LEN],
    sealed_info: &[u8],
) -> Result<(SessionCipher, DeviceInfo)> {
    verify_tag(
        &state.keys.decrypt_key,
        &[&state.initiator_nonce, &state.responder_nonce],
        &tag,
        constants::ERR_CONFIRMATION_MISMATCH,
    )?;

    let mut cipher = SessionCipher::new(&state.keys);
    let plaintext = cipher
        .open(sealed_info)
        .map_err(|_| ProtocolError::AuthenticationFailed(constants::ERR_DEVICE_INFO_UNREADABLE))?;
    let info: DeviceInfo = bincode::deserialize(&plaintext)
        .map_err(|_| ProtocolError::AuthenticationFailed(constants::ERR_DEVICE_INFO_UNREADABLE))?;

    debug!(peer = %info.identifier, "Responder finalized handshake");
    Ok((cipher, info))
}
