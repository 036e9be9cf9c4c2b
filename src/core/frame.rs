//! Wire-independent frame model shared by both wire formats.

use bytes::Bytes;
use std::fmt;

/// Frame type tag carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Ack,
    SessionConfig,
    Data,
    Chunk,
}

impl FrameType {
    pub fn to_raw(self) -> u8 {
        match self {
            FrameType::Ack => 1,
            FrameType::SessionConfig => 2,
            FrameType::Data => 3,
            FrameType::Chunk => 4,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FrameType::Ack),
            2 => Some(FrameType::SessionConfig),
            3 => Some(FrameType::Data),
            4 => Some(FrameType::Chunk),
            _ => None,
        }
    }

    /// Ack and SessionConfig frames carry link-level control only
    pub fn is_control(self) -> bool {
        matches!(self, FrameType::Ack | FrameType::SessionConfig)
    }
}

/// Logical channel a frame belongs to.
///
/// Each wire format maps these to its own raw channel numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Link-level control (acks, session config, protocol version)
    Version,
    /// Structured request/response commands
    Command,
    /// Activity/health sample streams
    Activity,
    /// Bulk data uploads (watchfaces, firmware, files)
    Bulk,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Version,
        Channel::Command,
        Channel::Activity,
        Channel::Bulk,
    ];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Version => "version",
            Channel::Command => "command",
            Channel::Activity => "activity",
            Channel::Bulk => "bulk",
        };
        f.write_str(name)
    }
}

/// Per-frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// Payload is a sealed (AEAD) message
    pub encrypted: bool,
    /// Sender expects an Ack frame for this sequence number
    pub needs_response: bool,
}

impl FrameFlags {
    pub const fn plain() -> Self {
        Self {
            encrypted: false,
            needs_response: false,
        }
    }

    pub const fn encrypted() -> Self {
        Self {
            encrypted: true,
            needs_response: false,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: Channel,
    pub sequence: u8,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        frame_type: FrameType,
        channel: Channel,
        sequence: u8,
        flags: FrameFlags,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            frame_type,
            channel,
            sequence,
            flags,
            payload: payload.into(),
        }
    }

    pub fn data(channel: Channel, sequence: u8, flags: FrameFlags, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, channel, sequence, flags, payload)
    }

    pub fn chunk(channel: Channel, sequence: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Chunk, channel, sequence, FrameFlags::plain(), payload)
    }

    pub fn ack(sequence: u8) -> Self {
        Self::new(
            FrameType::Ack,
            Channel::Version,
            sequence,
            FrameFlags::plain(),
            Bytes::new(),
        )
    }

    pub fn session_config(sequence: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(
            FrameType::SessionConfig,
            Channel::Version,
            sequence,
            FrameFlags::plain(),
            payload,
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame{{ type={:?}, channel={}, seq={}, encrypted={}, needs_response={}, len={} }}",
            self.frame_type,
            self.channel,
            self.sequence,
            self.flags.encrypted,
            self.flags.needs_response,
            self.payload.len()
        )
    }
}
