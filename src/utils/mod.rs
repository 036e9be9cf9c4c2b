//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: AES-128-CCM session cipher with per-direction nonce counters
//! - **Replay Cache**: bitset of accepted receive counters
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Default durations and async timeout wrappers
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod timeout;

pub use replay_cache::ReplayCache;
