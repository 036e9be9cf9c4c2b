//! Legacy framing: fixed preamble, type/channel nibble byte, length, and a
//! trailing marker.
//!
//! ```text
//! [BA DC FE] [type<<4 | channel] [flags] [len: u16 LE] [opcode] [seq] [data_type] [payload] [EF]
//! ```
//!
//! `len` covers the three payload-header bytes (opcode, seq, data type) plus
//! the payload. There is no checksum; the trailer is the only integrity check.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::codec::{check_preamble, DecodeOutcome, WireFormat, WireFormatKind};
use crate::core::frame::{Channel, Frame, FrameFlags, FrameType};
use crate::error::{constants, ProtocolError, Result};

pub const PREAMBLE: [u8; 3] = [0xBA, 0xDC, 0xFE];
pub const TRAILER: u8 = 0xEF;

/// preamble + type/channel + flags + length
const FIXED_HEADER_LEN: usize = 7;
/// opcode + sequence + data type
const PAYLOAD_HEADER_LEN: usize = 3;
const FRAME_OVERHEAD: usize = FIXED_HEADER_LEN + PAYLOAD_HEADER_LEN + 1;

const FLAG_MARKER: u8 = 0x80;
const FLAG_NEEDS_RESPONSE: u8 = 0x40;

const OPCODE_SEND: u8 = 2;

const DATA_TYPE_PLAIN: u8 = 0;
const DATA_TYPE_ENCRYPTED: u8 = 1;
const DATA_TYPE_AUTH: u8 = 2;

const RAW_CHANNEL_VERSION: u8 = 0;
const RAW_CHANNEL_COMMAND_RX: u8 = 1;
const RAW_CHANNEL_COMMAND_TX: u8 = 2;
const RAW_CHANNEL_ACTIVITY: u8 = 3;
const RAW_CHANNEL_BULK: u8 = 5;

fn raw_channel(channel: Channel) -> u8 {
    match channel {
        Channel::Version => RAW_CHANNEL_VERSION,
        Channel::Command => RAW_CHANNEL_COMMAND_TX,
        Channel::Activity => RAW_CHANNEL_ACTIVITY,
        Channel::Bulk => RAW_CHANNEL_BULK,
    }
}

fn channel_from_raw(raw: u8) -> Option<Channel> {
    match raw {
        RAW_CHANNEL_VERSION => Some(Channel::Version),
        RAW_CHANNEL_COMMAND_RX | RAW_CHANNEL_COMMAND_TX => Some(Channel::Command),
        RAW_CHANNEL_ACTIVITY => Some(Channel::Activity),
        RAW_CHANNEL_BULK => Some(Channel::Bulk),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LegacyFormat {
    max_payload: usize,
}

impl LegacyFormat {
    pub fn new(max_payload: usize) -> Self {
        // the length field must also hold the payload header
        Self {
            max_payload: max_payload.min(u16::MAX as usize - PAYLOAD_HEADER_LEN),
        }
    }
}

impl WireFormat for LegacyFormat {
    fn kind(&self) -> WireFormatKind {
        WireFormatKind::Legacy
    }

    fn preamble(&self) -> &'static [u8] {
        &PREAMBLE
    }

    fn overhead(&self, _frame: &Frame) -> usize {
        FRAME_OVERHEAD
    }

    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(ProtocolError::OversizedFrame(len));
        }

        dst.reserve(len + FRAME_OVERHEAD);
        dst.put_slice(&PREAMBLE);
        dst.put_u8((frame.frame_type.to_raw() << 4) | (raw_channel(frame.channel) & 0x0f));

        let mut flags = FLAG_MARKER;
        if frame.flags.needs_response {
            flags |= FLAG_NEEDS_RESPONSE;
        }
        dst.put_u8(flags);
        dst.put_u16_le((len + PAYLOAD_HEADER_LEN) as u16);

        dst.put_u8(OPCODE_SEND);
        dst.put_u8(frame.sequence);
        dst.put_u8(if frame.flags.encrypted {
            DATA_TYPE_ENCRYPTED
        } else {
            DATA_TYPE_PLAIN
        });
        dst.put_slice(&frame.payload);
        dst.put_u8(TRAILER);
        Ok(())
    }

    fn decode(&self, buf: &[u8]) -> DecodeOutcome {
        if let Some(outcome) = check_preamble(buf, &PREAMBLE) {
            return outcome;
        }

        let type_channel = match buf.get(3) {
            Some(b) => *b,
            None => return DecodeOutcome::Incomplete,
        };
        let frame_type = match FrameType::from_raw(type_channel >> 4) {
            Some(t) => t,
            None => return DecodeOutcome::Invalid(constants::ERR_UNKNOWN_FRAME_TYPE),
        };
        let channel = match channel_from_raw(type_channel & 0x0f) {
            Some(c) => c,
            None => return DecodeOutcome::Invalid(constants::ERR_UNKNOWN_CHANNEL),
        };

        if buf.len() < FIXED_HEADER_LEN {
            return DecodeOutcome::Incomplete;
        }

        let flags = buf[4];
        let declared = u16::from_le_bytes([buf[5], buf[6]]) as usize;
        if declared < PAYLOAD_HEADER_LEN || declared - PAYLOAD_HEADER_LEN > self.max_payload {
            return DecodeOutcome::Invalid(constants::ERR_LENGTH_OUT_OF_RANGE);
        }
        let payload_len = declared - PAYLOAD_HEADER_LEN;
        let total = payload_len + FRAME_OVERHEAD;
        if buf.len() < total {
            return DecodeOutcome::Incomplete;
        }

        if buf[total - 1] != TRAILER {
            return DecodeOutcome::Invalid(constants::ERR_BAD_TRAILER);
        }

        let sequence = buf[8];
        let encrypted = match buf[9] {
            DATA_TYPE_ENCRYPTED => true,
            DATA_TYPE_PLAIN | DATA_TYPE_AUTH => false,
            _ => {
                return DecodeOutcome::Discard {
                    consumed: total,
                    reason: constants::ERR_UNKNOWN_DATA_TYPE,
                }
            }
        };

        let start = FIXED_HEADER_LEN + PAYLOAD_HEADER_LEN;
        let frame = Frame {
            frame_type,
            channel,
            sequence,
            flags: FrameFlags {
                encrypted,
                needs_response: flags & FLAG_NEEDS_RESPONSE != 0,
            },
            payload: Bytes::copy_from_slice(&buf[start..start + payload_len]),
        };

        DecodeOutcome::Complete {
            frame,
            consumed: total,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MAX_FRAME_PAYLOAD;

    fn encode(frame: &Frame) -> BytesMut {
        let mut dst = BytesMut::new();
        LegacyFormat::new(MAX_FRAME_PAYLOAD).encode(frame, &mut dst).unwrap();
        dst
    }

    #[test]
    fn layout_matches_wire() {
        let frame = Frame::data(Channel::Command, 0x11, FrameFlags::encrypted(), vec![0xAA, 0xBB]);
        let bytes = encode(&frame);
        assert_eq!(
            &bytes[..],
            &[0xBA, 0xDC, 0xFE, 0x32, 0x80, 0x05, 0x00, 0x02, 0x11, 0x01, 0xAA, 0xBB, 0xEF]
        );
    }

    #[test]
    fn rx_command_channel_decodes_as_command() {
        let mut bytes = encode(&Frame::data(Channel::Command, 1, FrameFlags::plain(), vec![1]));
        bytes[3] = 0x31;
        match LegacyFormat::new(MAX_FRAME_PAYLOAD).decode(&bytes) {
            DecodeOutcome::Complete { frame, .. } => assert_eq!(frame.channel, Channel::Command),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_trailer_is_invalid() {
        let mut bytes = encode(&Frame::data(Channel::Bulk, 1, FrameFlags::plain(), vec![1, 2, 3]));
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert_eq!(
            LegacyFormat::new(MAX_FRAME_PAYLOAD).decode(&bytes),
            DecodeOutcome::Invalid(constants::ERR_BAD_TRAILER)
        );
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let bytes = encode(&Frame::data(Channel::Bulk, 1, FrameFlags::plain(), vec![7; 40]));
        let format = LegacyFormat::new(MAX_FRAME_PAYLOAD);
        for cut in 1..bytes.len() {
            assert_eq!(format.decode(&bytes[..cut]), DecodeOutcome::Incomplete, "cut {cut}");
        }
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let format = LegacyFormat::new(16);
        let mut dst = BytesMut::new();
        let frame = Frame::data(Channel::Bulk, 0, FrameFlags::plain(), vec![0; 17]);
        assert!(matches!(
            format.encode(&frame, &mut dst),
            Err(ProtocolError::OversizedFrame(17))
        ));
    }
}
