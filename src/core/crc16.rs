//! CRC16-length-prefixed framing.
//!
//! ```text
//! [A5 A5] [flags<<4 | type] [seq] [len: u16 LE] [crc16: u16 LE] [payload]
//! ```
//!
//! Data and Chunk payloads start with a `[channel][opcode]` sub-header
//! (opcode `1` plaintext, `2` encrypted) that is covered by `len` and the
//! checksum. Ack and SessionConfig frames have no sub-header. No trailer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::checksum::crc16_arc;
use crate::core::codec::{check_preamble, DecodeOutcome, WireFormat, WireFormatKind};
use crate::core::frame::{Channel, Frame, FrameFlags, FrameType};
use crate::error::{constants, ProtocolError, Result};

pub const PREAMBLE: [u8; 2] = [0xA5, 0xA5];

const HEADER_LEN: usize = 8;
const SUBHEADER_LEN: usize = 2;

const FLAG_NEEDS_RESPONSE: u8 = 0x1;

const OPCODE_SEND_PLAINTEXT: u8 = 1;
const OPCODE_SEND_ENCRYPTED: u8 = 2;

const RAW_CHANNEL_VERSION: u8 = 0;
const RAW_CHANNEL_COMMAND: u8 = 1;
const RAW_CHANNEL_BULK: u8 = 2;
const RAW_CHANNEL_ACTIVITY: u8 = 5;

fn raw_channel(channel: Channel) -> u8 {
    match channel {
        Channel::Version => RAW_CHANNEL_VERSION,
        Channel::Command => RAW_CHANNEL_COMMAND,
        Channel::Bulk => RAW_CHANNEL_BULK,
        Channel::Activity => RAW_CHANNEL_ACTIVITY,
    }
}

fn channel_from_raw(raw: u8) -> Option<Channel> {
    match raw {
        RAW_CHANNEL_VERSION => Some(Channel::Version),
        RAW_CHANNEL_COMMAND => Some(Channel::Command),
        RAW_CHANNEL_BULK => Some(Channel::Bulk),
        RAW_CHANNEL_ACTIVITY => Some(Channel::Activity),
        _ => None,
    }
}

fn has_subheader(frame_type: FrameType) -> bool {
    !frame_type.is_control()
}

#[derive(Debug, Clone)]
pub struct Crc16Format {
    max_payload: usize,
}

impl Crc16Format {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u16::MAX as usize - SUBHEADER_LEN),
        }
    }
}

impl WireFormat for Crc16Format {
    fn kind(&self) -> WireFormatKind {
        WireFormatKind::Crc16
    }

    fn preamble(&self) -> &'static [u8] {
        &PREAMBLE
    }

    fn overhead(&self, frame: &Frame) -> usize {
        if has_subheader(frame.frame_type) {
            HEADER_LEN + SUBHEADER_LEN
        } else {
            HEADER_LEN
        }
    }

    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(ProtocolError::OversizedFrame(len));
        }

        let subheader = if has_subheader(frame.frame_type) {
            let opcode = if frame.flags.encrypted {
                OPCODE_SEND_ENCRYPTED
            } else {
                OPCODE_SEND_PLAINTEXT
            };
            Some([raw_channel(frame.channel), opcode])
        } else {
            if frame.channel != Channel::Version || frame.flags.encrypted {
                return Err(ProtocolError::Encode(format!(
                    "{:?} frames carry no channel or encryption",
                    frame.frame_type
                )));
            }
            None
        };

        let mut body = BytesMut::with_capacity(len + SUBHEADER_LEN);
        if let Some(sub) = subheader {
            body.put_slice(&sub);
        }
        body.put_slice(&frame.payload);

        let flags = if frame.flags.needs_response {
            FLAG_NEEDS_RESPONSE
        } else {
            0
        };

        dst.reserve(HEADER_LEN + body.len());
        dst.put_slice(&PREAMBLE);
        dst.put_u8((flags << 4) | (frame.frame_type.to_raw() & 0x0f));
        dst.put_u8(frame.sequence);
        dst.put_u16_le(body.len() as u16);
        dst.put_u16_le(crc16_arc(&body));
        dst.put_slice(&body);
        Ok(())
    }

    fn decode(&self, buf: &[u8]) -> DecodeOutcome {
        if let Some(outcome) = check_preamble(buf, &PREAMBLE) {
            return outcome;
        }

        let type_byte = match buf.get(2) {
            Some(b) => *b,
            None => return DecodeOutcome::Incomplete,
        };
        let frame_type = match FrameType::from_raw(type_byte & 0x0f) {
            Some(t) => t,
            None => return DecodeOutcome::Invalid(constants::ERR_UNKNOWN_FRAME_TYPE),
        };
        let needs_response = (type_byte >> 4) & FLAG_NEEDS_RESPONSE != 0;

        if buf.len() < HEADER_LEN {
            return DecodeOutcome::Incomplete;
        }

        let sequence = buf[3];
        let declared = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let limit = if has_subheader(frame_type) {
            self.max_payload + SUBHEADER_LEN
        } else {
            self.max_payload
        };
        if declared > limit {
            return DecodeOutcome::Invalid(constants::ERR_LENGTH_OUT_OF_RANGE);
        }

        let total = HEADER_LEN + declared;
        if buf.len() < total {
            return DecodeOutcome::Incomplete;
        }

        let given = u16::from_le_bytes([buf[6], buf[7]]);
        let body = &buf[HEADER_LEN..total];
        if crc16_arc(body) != given {
            return DecodeOutcome::Invalid(constants::ERR_BAD_CHECKSUM);
        }

        let (channel, encrypted, payload) = if has_subheader(frame_type) {
            if body.len() < SUBHEADER_LEN {
                return DecodeOutcome::Discard {
                    consumed: total,
                    reason: constants::ERR_SUBHEADER_MISSING,
                };
            }
            let channel = match channel_from_raw(body[0] & 0x0f) {
                Some(c) => c,
                None => {
                    return DecodeOutcome::Discard {
                        consumed: total,
                        reason: constants::ERR_UNKNOWN_CHANNEL,
                    }
                }
            };
            let encrypted = match body[1] {
                OPCODE_SEND_ENCRYPTED => true,
                OPCODE_SEND_PLAINTEXT => false,
                _ => {
                    return DecodeOutcome::Discard {
                        consumed: total,
                        reason: constants::ERR_UNKNOWN_DATA_TYPE,
                    }
                }
            };
            (channel, encrypted, &body[SUBHEADER_LEN..])
        } else {
            (Channel::Version, false, body)
        };

        DecodeOutcome::Complete {
            frame: Frame {
                frame_type,
                channel,
                sequence,
                flags: FrameFlags {
                    encrypted,
                    needs_response,
                },
                payload: Bytes::copy_from_slice(payload),
            },
            consumed: total,
        }
    }
}
