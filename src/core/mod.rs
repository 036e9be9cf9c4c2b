//! # Core Protocol Components
//!
//! Frame model and wire codecs.
//!
//! ## Components
//! - **Frame**: wire-independent frame model (type, channel, sequence, flags)
//! - **Codec**: Tokio codec performing framing and resynchronization
//! - **Legacy / Crc16**: the two wire formats behind [`codec::WireFormat`]
//!
//! ## Wire Formats
//! ```text
//! Legacy: [BA DC FE] [type<<4|chan] [flags] [len(2)] [op] [seq] [dtype] [payload] [EF]
//! Crc16:  [A5 A5] [flags<<4|type] [seq] [len(2)] [crc16(2)] [payload]
//! ```
//!
//! ## Security
//! - Declared lengths are bounded by the configured maximum before buffering
//! - Corrupt or foreign bytes are skipped by scanning to the next preamble

pub mod checksum;
pub mod codec;
pub mod crc16;
pub mod frame;
pub mod legacy;
