//! # Error Types
//!
//! Error handling for the wearable link.
//!
//! This module defines every error variant that can occur while framing,
//! securing, chunking and dispatching traffic on a connection.
//!
//! ## Error Categories
//! - **Framing**: malformed frames; the codec resynchronizes and carries on
//! - **Integrity**: AEAD verification failures; the frame is dropped, the session survives
//! - **Authentication**: handshake tag mismatch; fatal to this connection attempt
//! - **Transfer**: chunk reassembly could not be recovered; the transfer restarts
//! - **Request**: timeouts (soft) and send failures (fail the request and its chain)
//! - **Configuration / I/O**: everything around the protocol core
//!
//! ## Example Usage
//! ```rust
//! use wearable_link::error::{ProtocolError, Result};
//! use tracing::warn;
//!
//! fn check_len(len: usize) -> Result<()> {
//!     if len > 0xffff {
//!         return Err(ProtocolError::OversizedFrame(len));
//!     }
//!     Ok(())
//! }
//!
//! if let Err(e) = check_len(70_000) {
//!     warn!(error = %e, "rejected frame");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to avoid allocations on common error paths.
pub mod constants {
    /// Handshake errors
    pub const ERR_HANDSHAKE_TAG_MISMATCH: &str = "Handshake tag mismatch";
    pub const ERR_CONFIRMATION_MISMATCH: &str = "Handshake confirmation tag mismatch";
    pub const ERR_KEYS_NOT_DERIVED: &str = "Session keys not derived";
    pub const ERR_UNEXPECTED_HANDSHAKE_STEP: &str = "Unexpected handshake step";
    pub const ERR_DEVICE_REJECTED: &str = "Device rejected authentication";
    pub const ERR_DEVICE_INFO_UNREADABLE: &str = "Sealed device info could not be opened";
    pub const ERR_PLAINTEXT_NOT_ALLOWED: &str = "Plaintext bootstrap not allowed in encrypted mode";
    pub const ERR_RANDOM_UNAVAILABLE: &str = "System random source unavailable";

    /// Session errors
    pub const ERR_SESSION_NOT_ESTABLISHED: &str = "Session not established";
    pub const ERR_SESSION_NOT_ENCRYPTING: &str = "Session has no encryption keys";

    /// Crypto errors
    pub const ERR_SEALED_TOO_SHORT: &str = "Sealed payload too short";
    pub const ERR_TAG_VERIFICATION: &str = "AEAD tag verification failed";
    pub const ERR_COUNTER_REPLAYED: &str = "Nonce counter already seen in this session";
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";

    /// Framing errors
    pub const ERR_BAD_PREAMBLE: &str = "Preamble mismatch";
    pub const ERR_BAD_TRAILER: &str = "Trailer mismatch";
    pub const ERR_BAD_CHECKSUM: &str = "Payload checksum mismatch";
    pub const ERR_UNKNOWN_FRAME_TYPE: &str = "Unknown frame type";
    pub const ERR_UNKNOWN_CHANNEL: &str = "Unknown channel";
    pub const ERR_UNKNOWN_DATA_TYPE: &str = "Unknown data type";
    pub const ERR_LENGTH_OUT_OF_RANGE: &str = "Declared length out of range";
    pub const ERR_SUBHEADER_MISSING: &str = "Channel sub-header missing";

    /// Transfer errors
    pub const ERR_TOO_MANY_CHUNKS: &str = "Payload needs more chunks than the index space allows";
    pub const ERR_MTU_TOO_SMALL: &str = "MTU too small to carry chunks";
    pub const ERR_RESTART_REQUESTED: &str = "Peer requested transfer restart";
    pub const ERR_MISSING_RETRIES: &str = "Missing-chunk retries exhausted";
    pub const ERR_START_RETRIES: &str = "No acknowledgement for transfer start";
    pub const ERR_SEND_FAILED: &str = "Transport write failed mid-transfer";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
}

/// ProtocolError is the primary error type for all link operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Framing error: {0}")]
    Framing(&'static str),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Integrity error: {0}")]
    Integrity(&'static str),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Session error: {0}")]
    Session(&'static str),

    #[error("Nonce counter exhausted for this session")]
    NonceExhausted,

    #[error("Transfer abandoned: {0}")]
    TransferAbandoned(&'static str),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Operation timed out")]
    Timeout,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Command decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Credential error: {0}")]
    Credentials(String),
}

impl ProtocolError {
    /// Errors the link recovers from locally without involving the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Framing(_)
                | ProtocolError::Integrity(_)
                | ProtocolError::Decode(_)
                | ProtocolError::RequestTimeout
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
