//! Session configuration exchange for the Crc16 wire format.
//!
//! Payload of a SessionConfig frame: `[opcode][tlv...]`, each TLV being
//! `key:u8 len:u16 LE value`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::config::MAX_FRAME_PAYLOAD;
use crate::error::{ProtocolError, Result};

pub const OPCODE_START_REQUEST: u8 = 1;
pub const OPCODE_START_RESPONSE: u8 = 2;
pub const OPCODE_STOP_REQUEST: u8 = 3;
pub const OPCODE_STOP_RESPONSE: u8 = 4;

const KEY_VERSION: u8 = 1;
const KEY_MAX_PACKET_SIZE: u8 = 2;
const KEY_TX_WINDOW: u8 = 3;
const KEY_SEND_TIMEOUT: u8 = 4;

const TLV_HEADER_LEN: usize = 3;

/// Values announced in a session start request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub version: [u8; 3],
    pub max_packet_size: u16,
    pub tx_window: u16,
    /// Milliseconds
    pub send_timeout: u16,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            version: [1, 0, 0],
            max_packet_size: MAX_FRAME_PAYLOAD as u16,
            tx_window: 32,
            send_timeout: 10_000,
        }
    }
}

impl SessionParams {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_tlv(buf, KEY_VERSION, &self.version);
        put_tlv(buf, KEY_MAX_PACKET_SIZE, &self.max_packet_size.to_le_bytes());
        put_tlv(buf, KEY_TX_WINDOW, &self.tx_window.to_le_bytes());
        put_tlv(buf, KEY_SEND_TIMEOUT, &self.send_timeout.to_le_bytes());
    }

    /// Parse TLVs, starting from defaults. Unknown keys and values of the
    /// wrong size are skipped.
    fn decode_from(mut buf: &[u8]) -> Result<Self> {
        let mut params = SessionParams::default();
        while buf.has_remaining() {
            if buf.len() < TLV_HEADER_LEN {
                return Err(ProtocolError::Decode(format!(
                    "truncated session config TLV header ({} bytes left)",
                    buf.len()
                )));
            }
            let key = buf.get_u8();
            let len = buf.get_u16_le() as usize;
            if buf.len() < len {
                return Err(ProtocolError::Decode(format!(
                    "session config TLV {key} declares {len} bytes, {} available",
                    buf.len()
                )));
            }
            let value = &buf[..len];
            match (key, len) {
                (KEY_VERSION, 3) => params.version.copy_from_slice(value),
                (KEY_MAX_PACKET_SIZE, 2) => params.max_packet_size = u16::from_le_bytes([value[0], value[1]]),
                (KEY_TX_WINDOW, 2) => params.tx_window = u16::from_le_bytes([value[0], value[1]]),
                (KEY_SEND_TIMEOUT, 2) => params.send_timeout = u16::from_le_bytes([value[0], value[1]]),
                (KEY_VERSION..=KEY_SEND_TIMEOUT, _) => {
                    warn!(key, len, "session config value has unexpected size, skipping")
                }
                _ => warn!(key, len, "unknown session config key, skipping"),
            }
            buf.advance(len);
        }
        Ok(params)
    }
}

fn put_tlv(buf: &mut BytesMut, key: u8, value: &[u8]) {
    buf.put_u8(key);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionConfigMessage {
    StartRequest(SessionParams),
    StartResponse(SessionParams),
    StopRequest,
    StopResponse,
}

impl SessionConfigMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            SessionConfigMessage::StartRequest(params) => {
                buf.put_u8(OPCODE_START_REQUEST);
                params.encode_into(&mut buf);
            }
            SessionConfigMessage::StartResponse(params) => {
                buf.put_u8(OPCODE_START_RESPONSE);
                params.encode_into(&mut buf);
            }
            SessionConfigMessage::StopRequest => buf.put_u8(OPCODE_STOP_REQUEST),
            SessionConfigMessage::StopResponse => buf.put_u8(OPCODE_STOP_RESPONSE),
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (&opcode, rest) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::Decode("empty session config payload".into()))?;
        match opcode {
            OPCODE_START_REQUEST => Ok(Self::StartRequest(SessionParams::decode_from(rest)?)),
            OPCODE_START_RESPONSE => Ok(Self::StartResponse(SessionParams::decode_from(rest)?)),
            OPCODE_STOP_REQUEST => Ok(Self::StopRequest),
            OPCODE_STOP_RESPONSE => Ok(Self::StopResponse),
            other => Err(ProtocolError::Decode(format!(
                "unknown session config opcode {other}"
            ))),
        }
    }
}
