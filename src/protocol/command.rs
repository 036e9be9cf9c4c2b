//! Decoded-command boundary.
//!
//! Reassembled, decrypted channel payloads are turned into [`Command`]s by a
//! pluggable [`CommandCodec`]; unmatched commands and raw channel payloads
//! are handed to an [`EventSink`].

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

use crate::core::frame::Channel;
use crate::error::{ProtocolError, Result};

/// Length of the category + subtype header written by [`TaggedCommandCodec`]
pub const COMMAND_HEADER_LEN: usize = 4;

/// One structured command exchanged on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub channel: Channel,
    pub category: u16,
    pub subtype: u16,
    pub body: Bytes,
}

impl Command {
    pub fn new(category: u16, subtype: u16, body: impl Into<Bytes>) -> Self {
        Self {
            channel: Channel::Command,
            category,
            subtype,
            body: body.into(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command{{ channel={}, category={}, subtype={}, len={} }}",
            self.channel,
            self.category,
            self.subtype,
            self.body.len()
        )
    }
}

/// Converts channel payloads to and from commands.
pub trait CommandCodec: Send {
    /// `Ok(None)` means the channel carries raw payloads, not commands.
    fn decode(&self, channel: Channel, payload: &[u8]) -> Result<Option<Command>>;

    fn encode(&self, command: &Command) -> Result<Bytes>;
}

/// Default codec: `[category u16 LE][subtype u16 LE][body]` on the Command
/// channel; every other channel is raw.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedCommandCodec;

impl CommandCodec for TaggedCommandCodec {
    fn decode(&self, channel: Channel, payload: &[u8]) -> Result<Option<Command>> {
        if channel != Channel::Command {
            return Ok(None);
        }
        if payload.len() < COMMAND_HEADER_LEN {
            return Err(ProtocolError::Decode(format!(
                "command payload too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Some(Command {
            channel,
            category: u16::from_le_bytes([payload[0], payload[1]]),
            subtype: u16::from_le_bytes([payload[2], payload[3]]),
            body: Bytes::copy_from_slice(&payload[COMMAND_HEADER_LEN..]),
        }))
    }

    fn encode(&self, command: &Command) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN + command.body.len());
        buf.put_u16_le(command.category);
        buf.put_u16_le(command.subtype);
        buf.put_slice(&command.body);
        Ok(buf.freeze())
    }
}

/// Receives traffic no pending request claimed
pub trait EventSink: Send {
    fn on_command(&mut self, command: Command);

    fn on_raw(&mut self, channel: Channel, payload: Bytes);
}

type CommandHandler = Box<dyn FnMut(&Command) + Send>;
type RawHandler = Box<dyn FnMut(Bytes) + Send>;

/// [`EventSink`] that dispatches commands by category and raw payloads by
/// channel. Unrouted traffic is logged and dropped.
#[derive(Default)]
pub struct CategoryRouter {
    commands: HashMap<u16, CommandHandler>,
    raw: HashMap<Channel, RawHandler>,
}

impl CategoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_category<F>(mut self, category: u16, handler: F) -> Self
    where
        F: FnMut(&Command) + Send + 'static,
    {
        self.commands.insert(category, Box::new(handler));
        self
    }

    pub fn on_channel<F>(mut self, channel: Channel, handler: F) -> Self
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        self.raw.insert(channel, Box::new(handler));
        self
    }
}

impl EventSink for CategoryRouter {
    fn on_command(&mut self, command: Command) {
        match self.commands.get_mut(&command.category) {
            Some(handler) => {
                trace!(%command, "routing command");
                handler(&command);
            }
            None => debug!(%command, "no handler for command category"),
        }
    }

    fn on_raw(&mut self, channel: Channel, payload: Bytes) {
        match self.raw.get_mut(&channel) {
            Some(handler) => handler(payload),
            None => debug!(%channel, len = payload.len(), "no handler for raw payload"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tagged_layout() {
        let codec = TaggedCommandCodec;
        let bytes = codec.encode(&Command::new(8, 0x0102, vec![0xEE])).unwrap();
        assert_eq!(&bytes[..], &[0x08, 0x00, 0x02, 0x01, 0xEE]);

        let cmd = codec.decode(Channel::Command, &bytes).unwrap().unwrap();
        assert_eq!(cmd.category, 8);
        assert_eq!(cmd.subtype, 0x0102);
        assert_eq!(&cmd.body[..], &[0xEE]);
    }

    #[test]
    fn non_command_channels_are_raw() {
        let codec = TaggedCommandCodec;
        assert!(codec.decode(Channel::Activity, &[1, 2, 3, 4, 5]).unwrap().is_none());
        assert!(codec.decode(Channel::Command, &[1, 2]).is_err());
    }

    #[test]
    fn router_dispatches_by_category() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut router = CategoryRouter::new()
            .on_category(7, move |cmd| sink.lock().unwrap().push(cmd.subtype));

        router.on_command(Command::new(7, 1, Bytes::new()));
        router.on_command(Command::new(9, 2, Bytes::new()));
        router.on_command(Command::new(7, 3, Bytes::new()));

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }
}
