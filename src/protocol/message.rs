//! Handshake messages carried as auth-category commands.
//!
//! Bodies are `bincode`-serialized; the subtype identifies the step so a
//! peer can reject a message arriving at the wrong point of the exchange.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::protocol::command::Command;

/// Command category reserved for authentication
pub const AUTH_CATEGORY: u16 = 1;

/// Nonce exchange (steps 1 and 2)
pub const SUBTYPE_NONCE: u16 = 26;
/// Confirmation (step 3) and the responder's verdict
pub const SUBTYPE_AUTH: u16 = 27;
/// Plaintext identifier bootstrap
pub const SUBTYPE_PLAINTEXT_IDENTIFIER: u16 = 5;

/// Metadata the initiator sends, sealed, in step 3
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub protocol_version: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Step 1: initiator nonce `Na`
    Nonce { nonce: [u8; 16] },
    /// Step 2: responder nonce `Nb` and `HMAC(Kb, Nb || Na)`
    NonceReply { nonce: [u8; 16], tag: [u8; 32] },
    /// Step 3: `HMAC(enc_key, Na || Nb)` and sealed [`DeviceInfo`]
    Confirm { tag: [u8; 32], sealed_info: Vec<u8> },
    /// Responder verdict on step 3
    Status { accepted: bool },
    /// Bootstrap without encryption
    PlaintextIdentifier { identifier: String },
}

impl HandshakeMessage {
    pub fn subtype(&self) -> u16 {
        match self {
            HandshakeMessage::Nonce { .. } | HandshakeMessage::NonceReply { .. } => SUBTYPE_NONCE,
            HandshakeMessage::Confirm { .. } | HandshakeMessage::Status { .. } => SUBTYPE_AUTH,
            HandshakeMessage::PlaintextIdentifier { .. } => SUBTYPE_PLAINTEXT_IDENTIFIER,
        }
    }

    pub fn to_command(&self) -> Result<Command> {
        let body = bincode::serialize(self)?;
        Ok(Command::new(AUTH_CATEGORY, self.subtype(), body))
    }

    pub fn from_command(command: &Command) -> Result<Self> {
        if command.category != AUTH_CATEGORY {
            return Err(ProtocolError::Decode(format!(
                "category {} is not a handshake category",
                command.category
            )));
        }
        let message: HandshakeMessage = bincode::deserialize(&command.body)?;
        if message.subtype() != command.subtype {
            return Err(ProtocolError::Decode(format!(
                "handshake subtype {} does not match body (expected {})",
                command.subtype,
                message.subtype()
            )));
        }
        Ok(message)
    }
}
