//! # wearable-link
//!
//! Secure, chunk-aware command transport between companion software and
//! Bluetooth wearables.
//!
//! ## Layers
//! - [`core`]: frame model and the two wire formats (legacy and Crc16)
//! - [`protocol`]: handshake, AES-CCM session, chunked transfers, request
//!   dispatch and the sans-IO [`protocol::link::Link`]
//! - [`service`]: Tokio driver running a link over any byte stream
//! - [`config`], [`error`], [`utils`]: configuration, errors, crypto, logging
//!   and metrics
//!
//! The link never touches a socket itself. Feed it bytes and timer expiries,
//! drain its [`protocol::link::Action`]s, or let
//! [`service::driver::spawn_link`] do both.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use config::LinkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::command::{Command, CommandCodec, EventSink};
pub use protocol::credentials::{CredentialStore, StaticCredentials};
pub use protocol::dispatcher::{CommandMatcher, Request, RequestId};
pub use protocol::link::{Action, Link, LinkEvent, TimerKey};
pub use service::driver::{spawn_link, LinkHandle};
