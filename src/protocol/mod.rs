//! # Protocol Layer
//!
//! Everything above framing: the secure session, chunked transfers, request
//! correlation and the per-connection [`link::Link`] that ties them together.
//!
//! ## Components
//! - **Handshake / Session**: nonce + HMAC key agreement, AES-CCM wrap/unwrap
//! - **Session Config**: Crc16 session parameter exchange
//! - **Chunking**: fragmentation and reassembly with selective retransmission
//! - **Dispatcher**: request/response matching, chains and timeouts
//! - **Command**: pluggable command codec and event sink boundary
//! - **Link**: sans-IO connection state machine
//!
//! ## Flow
//! ```text
//! bytes -> FrameCodec -> Transfers -> Session::open -> CommandCodec -> Dispatcher | EventSink
//! ```

pub mod chunking;
pub mod command;
pub mod credentials;
pub mod dispatcher;
pub mod handshake;
pub mod link;
pub mod message;
pub mod session;
pub mod session_config;

#[cfg(test)]
mod tests;
