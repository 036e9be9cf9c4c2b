//! Per-connection secure session.
//!
//! Drives the handshake for either role, then wraps and unwraps payloads.
//! At most one session is established per connection: a new handshake
//! replaces the cipher, which invalidates anything sealed under the old keys.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::credentials::CredentialStore;
use crate::protocol::handshake::{
    initiator_handshake_init, initiator_handshake_verify, responder_handshake_finalize,
    responder_handshake_response, InitiatorHandshakeState, ResponderHandshakeState,
};
use crate::protocol::message::{DeviceInfo, HandshakeMessage};
use crate::utils::crypto::SessionCipher;
use crate::utils::metrics::global_metrics;

/// Which side of the handshake this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Companion (phone) side: opens the session
    Initiator,
    /// Device side: answers the session
    Responder,
}

/// How the session is bootstrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Nonce/HMAC handshake, AES-CCM on every payload afterwards
    #[default]
    Encrypted,
    /// Identifier only, no encryption
    Plaintext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    HandshakeInProgress,
    Established,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::HandshakeInProgress => "handshake-in-progress",
            SessionState::Established => "established",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum Stage {
    Idle,
    AwaitingNonceReply(InitiatorHandshakeState),
    AwaitingVerdict(SessionCipher),
    AwaitingConfirm(ResponderHandshakeState),
}

/// What a handshake message produced
#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    /// Message to send back to the peer
    pub reply: Option<HandshakeMessage>,
    /// The session became established by this message
    pub established: bool,
}

pub struct Session {
    role: Role,
    mode: AuthMode,
    state: SessionState,
    stage: Stage,
    cipher: Option<SessionCipher>,
    peer: Option<DeviceInfo>,
    integrity_failures: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("encrypting", &self.cipher.is_some())
            .finish()
    }
}

impl Session {
    pub fn new(role: Role, mode: AuthMode) -> Self {
        Self {
            role,
            mode,
            state: SessionState::Unauthenticated,
            stage: Stage::Idle,
            cipher: None,
            peer: None,
            integrity_failures: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Established with encryption keys
    pub fn is_encrypting(&self) -> bool {
        self.is_established() && self.cipher.is_some()
    }

    /// Metadata the peer announced during the handshake
    pub fn peer(&self) -> Option<&DeviceInfo> {
        self.peer.as_ref()
    }

    pub fn integrity_failures(&self) -> u32 {
        self.integrity_failures
    }

    /// Start the session from the initiator side.
    ///
    /// Returns the first handshake message to send. In plaintext mode the
    /// session is established immediately.
    pub fn begin(&mut self, credentials: &dyn CredentialStore) -> Result<HandshakeMessage> {
        if self.role != Role::Initiator {
            return Err(ProtocolError::Session(constants::ERR_UNEXPECTED_HANDSHAKE_STEP));
        }
        self.reset();
        global_metrics().handshake_attempt();

        match self.mode {
            AuthMode::Encrypted => {
                let (state, message) = initiator_handshake_init()?;
                self.stage = Stage::AwaitingNonceReply(state);
                self.state = SessionState::HandshakeInProgress;
                Ok(message)
            }
            AuthMode::Plaintext => {
                self.establish(None);
                Ok(HandshakeMessage::PlaintextIdentifier {
                    identifier: credentials.local_identifier(),
                })
            }
        }
    }

    /// Advance the handshake with a message from the peer.
    ///
    /// `AuthenticationFailed` leaves the session `Failed`; an out-of-order
    /// message is rejected without changing state.
    pub fn on_handshake(
        &mut self,
        message: HandshakeMessage,
        credentials: &dyn CredentialStore,
        local_info: &DeviceInfo,
    ) -> Result<HandshakeOutcome> {
        let stage = std::mem::replace(&mut self.stage, Stage::Idle);

        let result = match (self.role, stage, message) {
            (Role::Initiator, Stage::AwaitingNonceReply(state), HandshakeMessage::NonceReply { nonce, tag }) => {
                let secret = credentials.secret()?;
                let (cipher, confirm) =
                    initiator_handshake_verify(state, &secret, nonce, tag, local_info)?;
                self.stage = Stage::AwaitingVerdict(cipher);
                Ok(HandshakeOutcome {
                    reply: Some(confirm),
                    established: false,
                })
            }
            (Role::Initiator, Stage::AwaitingVerdict(cipher), HandshakeMessage::Status { accepted }) => {
                if !accepted {
                    Err(ProtocolError::AuthenticationFailed(constants::ERR_DEVICE_REJECTED))
                } else {
                    self.establish(Some(cipher));
                    Ok(HandshakeOutcome {
                        reply: None,
                        established: true,
                    })
                }
            }
            (Role::Responder, _, HandshakeMessage::Nonce { nonce }) => {
                if self.is_established() {
                    info!("peer restarted the handshake; dropping current session keys");
                }
                self.reset();
                global_metrics().handshake_attempt();
                let secret = credentials.secret()?;
                let (state, reply) = responder_handshake_response(&secret, nonce)?;
                self.stage = Stage::AwaitingConfirm(state);
                self.state = SessionState::HandshakeInProgress;
                Ok(HandshakeOutcome {
                    reply: Some(reply),
                    established: false,
                })
            }
            (Role::Responder, Stage::AwaitingConfirm(state), HandshakeMessage::Confirm { tag, sealed_info }) => {
                let (cipher, peer) = responder_handshake_finalize(state, tag, &sealed_info)?;
                info!(peer = %peer.identifier, name = %peer.name, "peer authenticated");
                self.peer = Some(peer);
                self.establish(Some(cipher));
                Ok(HandshakeOutcome {
                    reply: Some(HandshakeMessage::Status { accepted: true }),
                    established: true,
                })
            }
            (Role::Responder, _, HandshakeMessage::PlaintextIdentifier { identifier }) => {
                if self.mode != AuthMode::Plaintext {
                    Err(ProtocolError::AuthenticationFailed(constants::ERR_PLAINTEXT_NOT_ALLOWED))
                } else {
                    self.reset();
                    global_metrics().handshake_attempt();
                    self.peer = Some(DeviceInfo {
                        identifier,
                        name: String::new(),
                        protocol_version: local_info.protocol_version,
                    });
                    self.establish(None);
                    Ok(HandshakeOutcome {
                        reply: None,
                        established: true,
                    })
                }
            }
            (role, stage, message) => {
                warn!(?role, step = message.subtype(), state = %self.state, "unexpected handshake message");
                self.stage = stage;
                return Err(ProtocolError::Session(constants::ERR_UNEXPECTED_HANDSHAKE_STEP));
            }
        };

        if let Err(ProtocolError::AuthenticationFailed(reason)) = &result {
            warn!(reason, "handshake failed");
            self.fail();
        }
        result
    }

    /// Seal a payload for sending. Fails unless the session is encrypting.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        if !self.is_established() {
            return Err(ProtocolError::Session(constants::ERR_SESSION_NOT_ESTABLISHED));
        }
        self.cipher
            .as_mut()
            .ok_or(ProtocolError::Session(constants::ERR_SESSION_NOT_ENCRYPTING))?
            .seal(plaintext)
    }

    /// Open a sealed payload, counting consecutive integrity failures.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Bytes> {
        let cipher = self
            .cipher
            .as_mut()
            .ok_or(ProtocolError::Session(constants::ERR_SESSION_NOT_ENCRYPTING))?;

        match cipher.open(sealed) {
            Ok(plaintext) => {
                self.integrity_failures = 0;
                Ok(plaintext)
            }
            Err(e) => {
                self.integrity_failures += 1;
                global_metrics().integrity_failure();
                Err(e)
            }
        }
    }

    /// Mark the session failed and drop any key material
    pub fn fail(&mut self) {
        global_metrics().handshake_failed();
        self.stage = Stage::Idle;
        self.cipher = None;
        self.state = SessionState::Failed;
    }

    /// Drop keys and handshake progress
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.cipher = None;
        self.peer = None;
        self.integrity_failures = 0;
        self.state = SessionState::Unauthenticated;
    }

    fn establish(&mut self, cipher: Option<SessionCipher>) {
        debug!(role = ?self.role, encrypted = cipher.is_some(), "session established");
        global_metrics().handshake_success();
        self.cipher = cipher;
        self.stage = Stage::Idle;
        self.integrity_failures = 0;
        self.state = SessionState::Established;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::credentials::StaticCredentials;

    fn creds(byte: u8, id: &str) -> StaticCredentials {
        StaticCredentials::new([byte; 16], id)
    }

    fn info(id: &str) -> DeviceInfo {
        DeviceInfo {
            identifier: id.into(),
            name: "test".into(),
            protocol_version: 1,
        }
    }

    fn run_handshake(initiator: &mut Session, responder: &mut Session, a: &StaticCredentials, b: &StaticCredentials) -> Result<()> {
        let m1 = initiator.begin(a)?;
        let r1 = responder.on_handshake(m1, b, &info("band"))?;
        let r2 = initiator.on_handshake(r1.reply.unwrap(), a, &info("phone"))?;
        let r3 = responder.on_handshake(r2.reply.unwrap(), b, &info("band"))?;
        assert!(r3.established);
        let r4 = initiator.on_handshake(r3.reply.unwrap(), a, &info("phone"))?;
        assert!(r4.established);
        Ok(())
    }

    #[test]
    fn encrypted_handshake_establishes_both_sides() {
        let mut phone = Session::new(Role::Initiator, AuthMode::Encrypted);
        let mut band = Session::new(Role::Responder, AuthMode::Encrypted);
        run_handshake(&mut phone, &mut band, &creds(7, "phone"), &creds(7, "band")).unwrap();

        assert!(phone.is_encrypting());
        assert!(band.is_encrypting());
        assert_eq!(band.peer().unwrap().identifier, "phone");

        let sealed = phone.seal(b"hello").unwrap();
        assert_eq!(&band.open(&sealed).unwrap()[..], b"hello");
    }

    #[test]
    fn mismatched_secret_fails_initiator() {
        let mut phone = Session::new(Role::Initiator, AuthMode::Encrypted);
        let mut band = Session::new(Role::Responder, AuthMode::Encrypted);
        let err = run_handshake(&mut phone, &mut band, &creds(7, "phone"), &creds(8, "band"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AuthenticationFailed(_)));
        assert_eq!(phone.state(), SessionState::Failed);
        assert!(phone.seal(b"x").is_err());
    }

    #[test]
    fn plaintext_bootstrap_skips_encryption() {
        let phone_creds = creds(0, "phone");
        let mut phone = Session::new(Role::Initiator, AuthMode::Plaintext);
        let mut band = Session::new(Role::Responder, AuthMode::Plaintext);

        let m1 = phone.begin(&phone_creds).unwrap();
        assert!(phone.is_established());
        assert!(!phone.is_encrypting());

        let out = band.on_handshake(m1, &creds(0, "band"), &info("band")).unwrap();
        assert!(out.established);
        assert!(out.reply.is_none());
        assert_eq!(band.peer().unwrap().identifier, "phone");
    }

    #[test]
    fn plaintext_identifier_rejected_in_encrypted_mode() {
        let mut band = Session::new(Role::Responder, AuthMode::Encrypted);
        let msg = HandshakeMessage::PlaintextIdentifier {
            identifier: "intruder".into(),
        };
        assert!(matches!(
            band.on_handshake(msg, &creds(0, "band"), &info("band")),
            Err(ProtocolError::AuthenticationFailed(_))
        ));
        assert_eq!(band.state(), SessionState::Failed);
    }

    #[test]
    fn out_of_order_message_keeps_state() {
        let phone_creds = creds(1, "phone");
        let mut phone = Session::new(Role::Initiator, AuthMode::Encrypted);
        phone.begin(&phone_creds).unwrap();

        let err = phone
            .on_handshake(HandshakeMessage::Status { accepted: true }, &phone_creds, &info("phone"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Session(_)));
        assert_eq!(phone.state(), SessionState::HandshakeInProgress);
    }

    #[test]
    fn consecutive_integrity_failures_are_counted() {
        let mut phone = Session::new(Role::Initiator, AuthMode::Encrypted);
        let mut band = Session::new(Role::Responder, AuthMode::Encrypted);
        run_handshake(&mut phone, &mut band, &creds(3, "phone"), &creds(3, "band")).unwrap();

        for _ in 0..3 {
            assert!(band.open(&[0, 9, 1, 2, 3, 4, 5]).is_err());
        }
        assert_eq!(band.integrity_failures(), 3);
        assert!(band.is_established());

        let sealed = phone.seal(b"ok").unwrap();
        band.open(&sealed).unwrap();
        assert_eq!(band.integrity_failures(), 0);
    }
}
