use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::config::MAX_FRAME_PAYLOAD;
use crate::core::crc16::Crc16Format;
use crate::core::frame::Frame;
use crate::core::legacy::LegacyFormat;
use crate::error::{ProtocolError, Result};

/// Result of trying to decode one frame from the front of a buffer
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A whole frame was decoded from the first `consumed` bytes
    Complete { frame: Frame, consumed: usize },
    /// The bytes so far are a valid frame prefix; wait for more
    Incomplete,
    /// The buffer does not start with a frame; the caller must resync
    Invalid(&'static str),
    /// A complete, checksum-valid frame whose contents cannot be used.
    /// Skip exactly `consumed` bytes without scanning.
    Discard {
        consumed: usize,
        reason: &'static str,
    },
}

/// One wire-format strategy, chosen once per connection.
pub trait WireFormat: Send + Sync + fmt::Debug {
    fn kind(&self) -> WireFormatKind;

    fn preamble(&self) -> &'static [u8];

    /// Bytes added around the payload for a frame of this type
    fn overhead(&self, frame: &Frame) -> usize;

    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()>;

    fn decode(&self, buf: &[u8]) -> DecodeOutcome;
}

/// Selects the wire format strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormatKind {
    /// Preamble + type/channel nibble + length, trailing marker
    Legacy,
    /// Preamble + type/sequence + length + CRC16 of the payload
    #[default]
    Crc16,
}

impl WireFormatKind {
    pub fn build(self, max_payload: usize) -> Box<dyn WireFormat> {
        match self {
            WireFormatKind::Legacy => Box::new(LegacyFormat::new(max_payload)),
            WireFormatKind::Crc16 => Box::new(Crc16Format::new(max_payload)),
        }
    }
}

/// Check the preamble at the front of `buf`.
///
/// Returns `Some(outcome)` when decoding must stop here.
pub(crate) fn check_preamble(buf: &[u8], preamble: &[u8]) -> Option<DecodeOutcome> {
    let n = buf.len().min(preamble.len());
    if buf[..n] != preamble[..n] {
        return Some(DecodeOutcome::Invalid(
            crate::error::constants::ERR_BAD_PREAMBLE,
        ));
    }
    if buf.len() < preamble.len() {
        return Some(DecodeOutcome::Incomplete);
    }
    None
}

/// Frame codec over a byte stream.
///
/// Wraps a [`WireFormat`] and performs resynchronization internally:
/// invalid prefixes are discarded up to the next possible preamble and
/// never surfaced to the caller.
pub struct FrameCodec {
    format: Box<dyn WireFormat>,
    resyncs: u64,
    discarded_bytes: u64,
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("format", &self.format.kind())
            .field("resyncs", &self.resyncs)
            .finish()
    }
}

impl FrameCodec {
    pub fn new(kind: WireFormatKind, max_payload: usize) -> Self {
        Self {
            format: kind.build(max_payload),
            resyncs: 0,
            discarded_bytes: 0,
        }
    }

    pub fn legacy() -> Self {
        Self::new(WireFormatKind::Legacy, MAX_FRAME_PAYLOAD)
    }

    pub fn crc16() -> Self {
        Self::new(WireFormatKind::Crc16, MAX_FRAME_PAYLOAD)
    }

    pub fn kind(&self) -> WireFormatKind {
        self.format.kind()
    }

    pub fn format(&self) -> &dyn WireFormat {
        self.format.as_ref()
    }

    /// Number of resynchronizations performed so far
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Bytes thrown away by resynchronization or discarded frames
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Encode a single frame into a fresh buffer
    pub fn encode_frame(&self, frame: &Frame) -> Result<BytesMut> {
        let mut dst = BytesMut::with_capacity(frame.payload.len() + self.format.overhead(frame));
        self.format.encode(frame, &mut dst)?;
        Ok(dst)
    }

    /// Offset of the next byte matching the preamble's first byte, skipping
    /// the current position. Everything before it is garbage.
    fn resync_offset(&self, buf: &[u8]) -> usize {
        let first = self.format.preamble()[0];
        buf.iter()
            .skip(1)
            .position(|&b| b == first)
            .map(|p| p + 1)
            .unwrap_or(buf.len())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }

            match self.format.decode(src) {
                DecodeOutcome::Complete { frame, consumed } => {
                    src.advance(consumed);
                    trace!(%frame, consumed, "decoded frame");
                    return Ok(Some(frame));
                }
                DecodeOutcome::Incomplete => return Ok(None),
                DecodeOutcome::Invalid(reason) => {
                    let skip = self.resync_offset(src);
                    self.resyncs += 1;
                    self.discarded_bytes += skip as u64;
                    debug!(reason, skip, "resynchronizing frame stream");
                    src.advance(skip);
                }
                DecodeOutcome::Discard { consumed, reason } => {
                    self.discarded_bytes += consumed as u64;
                    debug!(reason, consumed, "discarding unusable frame");
                    src.advance(consumed);
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.payload.len() + self.format.overhead(&item));
        self.format.encode(&item, dst)
    }
}
