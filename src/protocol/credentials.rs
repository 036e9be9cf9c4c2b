//! Pre-shared secret and local identity lookup.

use data_encoding::HEXLOWER_PERMISSIVE;
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

pub const SECRET_LEN: usize = 16;

/// Source of the pre-shared secret and the identifier this endpoint
/// announces. Persistent storage lives behind this trait.
pub trait CredentialStore: Send + Sync {
    fn secret(&self) -> Result<Zeroizing<[u8; SECRET_LEN]>>;

    fn local_identifier(&self) -> String;
}

/// Parse a 32-hex-character secret, optionally prefixed with `0x`
pub fn parse_secret_hex(input: &str) -> Result<Zeroizing<[u8; SECRET_LEN]>> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex.len() != SECRET_LEN * 2 {
        return Err(ProtocolError::Credentials(format!(
            "secret must be {} hex characters, got {}",
            SECRET_LEN * 2,
            hex.len()
        )));
    }

    let decoded = Zeroizing::new(
        HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map_err(|e| ProtocolError::Credentials(format!("secret is not valid hex: {e}")))?,
    );

    let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
    secret.copy_from_slice(&decoded);
    Ok(secret)
}

/// In-memory credentials
pub struct StaticCredentials {
    secret: Zeroizing<[u8; SECRET_LEN]>,
    identifier: String,
}

impl StaticCredentials {
    pub fn new(secret: [u8; SECRET_LEN], identifier: impl Into<String>) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            identifier: identifier.into(),
        }
    }

    pub fn from_hex(secret: &str, identifier: impl Into<String>) -> Result<Self> {
        Ok(Self {
            secret: parse_secret_hex(secret)?,
            identifier: identifier.into(),
        })
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

impl CredentialStore for StaticCredentials {
    fn secret(&self) -> Result<Zeroizing<[u8; SECRET_LEN]>> {
        Ok(self.secret.clone())
    }

    fn local_identifier(&self) -> String {
        self.identifier.clone()
    }
}
