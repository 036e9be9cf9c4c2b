//! Chunked transfers with selective retransmission.
//!
//! Payloads larger than one MTU travel as Chunk frames. The sender announces
//! the chunk count, waits for the receiver's start-ack, then sends every
//! chunk prefixed with its 1-based index. The receiver stores chunks by index
//! under an inactivity timer; when the timer fires it asks for the missing
//! indices, and once everything arrived it answers end-ack and delivers the
//! concatenated payload.
//!
//! Chunk frame payloads starting with a zero `u16` are control messages:
//!
//! ```text
//! 00 00 00 01 count:u16 enc:u8   start
//! 00 00 01 01                    start-ack
//! 00 00 01 00                    end-ack
//! 00 00 04 n idx:u16*n           missing-request (n = 0: restart)
//! ```
//!
//! [`Transfers`] is sans-IO: every operation returns [`ChunkOutput`]s for the
//! caller to send, schedule or deliver. At most one transfer per channel and
//! direction is active.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{TransferConfig, MIN_MTU};
use crate::core::frame::Channel;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::RequestId;
use crate::utils::metrics::global_metrics;

/// Bytes taken by the chunk index in every chunk part
pub const CHUNK_INDEX_LEN: usize = 2;

const CONTROL_MARKER: [u8; 2] = [0x00, 0x00];
const OP_START: u8 = 0x00;
const OP_ACK: u8 = 0x01;
const OP_MISSING: u8 = 0x04;
const MISSING_HEADER_LEN: usize = 4;

/// Transfer direction relative to this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// One decoded Chunk frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkMessage {
    Start { count: u16, encrypted: bool },
    StartAck,
    EndAck,
    /// Indices the receiver is still missing; empty means restart
    Missing(Vec<u16>),
    Part { index: u16, data: Bytes },
}

impl ChunkMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            ChunkMessage::Start { count, encrypted } => {
                let mut buf = BytesMut::with_capacity(7);
                buf.put_slice(&CONTROL_MARKER);
                buf.put_u8(OP_START);
                buf.put_u8(0x01);
                buf.put_u16_le(*count);
                buf.put_u8(u8::from(*encrypted));
                buf.freeze()
            }
            ChunkMessage::StartAck => Bytes::from_static(&[0x00, 0x00, OP_ACK, 0x01]),
            ChunkMessage::EndAck => Bytes::from_static(&[0x00, 0x00, OP_ACK, 0x00]),
            ChunkMessage::Missing(indices) => {
                let mut buf = BytesMut::with_capacity(MISSING_HEADER_LEN + indices.len() * 2);
                buf.put_slice(&CONTROL_MARKER);
                buf.put_u8(OP_MISSING);
                buf.put_u8(indices.len().min(u8::MAX as usize) as u8);
                for index in indices.iter().take(u8::MAX as usize) {
                    buf.put_u16_le(*index);
                }
                buf.freeze()
            }
            ChunkMessage::Part { index, data } => {
                let mut buf = BytesMut::with_capacity(CHUNK_INDEX_LEN + data.len());
                buf.put_u16_le(*index);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }

    pub fn decode(payload: &Bytes) -> Result<Self> {
        if payload.len() < CHUNK_INDEX_LEN {
            return Err(ProtocolError::Decode(format!(
                "chunk payload too short: {} bytes",
                payload.len()
            )));
        }
        let index = u16::from_le_bytes([payload[0], payload[1]]);
        if index != 0 {
            return Ok(ChunkMessage::Part {
                index,
                data: payload.slice(CHUNK_INDEX_LEN..),
            });
        }

        match payload.get(2..4) {
            Some([OP_START, 0x01]) if payload.len() >= 7 => Ok(ChunkMessage::Start {
                count: u16::from_le_bytes([payload[4], payload[5]]),
                encrypted: payload[6] != 0,
            }),
            Some([OP_ACK, 0x01]) => Ok(ChunkMessage::StartAck),
            Some([OP_ACK, 0x00]) => Ok(ChunkMessage::EndAck),
            Some([OP_MISSING, n]) => {
                let n = *n as usize;
                let body = &payload[MISSING_HEADER_LEN..];
                if body.len() < n * 2 {
                    return Err(ProtocolError::Decode(format!(
                        "missing-request lists {n} indices but carries {} bytes",
                        body.len()
                    )));
                }
                Ok(ChunkMessage::Missing(
                    body.chunks_exact(2)
                        .take(n)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect(),
                ))
            }
            _ => Err(ProtocolError::Decode(format!(
                "unknown chunk control message {:02x?}",
                &payload[..payload.len().min(MISSING_HEADER_LEN)]
            ))),
        }
    }
}

/// Split `payload` into parts of at most `capacity` bytes
pub fn split(payload: &Bytes, capacity: usize) -> Vec<Bytes> {
    if capacity == 0 {
        return Vec::new();
    }
    (0..payload.len())
        .step_by(capacity)
        .map(|start| payload.slice(start..(start + capacity).min(payload.len())))
        .collect()
}

/// What the caller must do after a transfer operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutput {
    /// Send a Chunk frame with this payload on the channel. `origin` is the
    /// request an outbound transfer carries; receiver replies have none.
    Send {
        channel: Channel,
        payload: Bytes,
        origin: Option<RequestId>,
    },
    /// (Re)schedule the transfer timer, replacing any pending one
    ArmTimer {
        channel: Channel,
        direction: Direction,
        after: Duration,
    },
    CancelTimer { channel: Channel, direction: Direction },
    /// A complete inbound payload, still sealed if `encrypted`
    Delivered {
        channel: Channel,
        payload: Bytes,
        encrypted: bool,
    },
    Progress {
        channel: Channel,
        direction: Direction,
        percent: u8,
    },
    Completed {
        channel: Channel,
        direction: Direction,
        origin: Option<RequestId>,
    },
    Abandoned {
        channel: Channel,
        direction: Direction,
        origin: Option<RequestId>,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundPhase {
    AwaitingStartAck,
    AwaitingEndAck,
}

struct OutboundTransfer {
    payload: Bytes,
    chunks: Vec<Bytes>,
    encrypted: bool,
    phase: OutboundPhase,
    restarts: u32,
    origin: Option<RequestId>,
}

impl OutboundTransfer {
    fn start_message(&self) -> Bytes {
        ChunkMessage::Start {
            count: self.chunks.len() as u16,
            encrypted: self.encrypted,
        }
        .encode()
    }

    fn part(&self, index: u16) -> Option<Bytes> {
        let data = self.chunks.get(usize::from(index).checked_sub(1)?)?;
        Some(
            ChunkMessage::Part {
                index,
                data: data.clone(),
            }
            .encode(),
        )
    }
}

struct InboundTransfer {
    slots: Vec<Option<Bytes>>,
    received: usize,
    encrypted: bool,
    missing_rounds: u32,
    last_percent: u8,
}

impl InboundTransfer {
    fn missing(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| (i + 1) as u16)
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn assemble(&self) -> Bytes {
        let total: usize = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for part in self.slots.iter().flatten() {
            buf.put_slice(part);
        }
        buf.freeze()
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}

/// Per-channel chunked transfer state for one connection
pub struct Transfers {
    mtu: usize,
    config: TransferConfig,
    outbound: HashMap<Channel, OutboundTransfer>,
    inbound: HashMap<Channel, InboundTransfer>,
}

impl fmt::Debug for Transfers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfers")
            .field("mtu", &self.mtu)
            .field("outbound", &self.outbound.keys().collect::<Vec<_>>())
            .field("inbound", &self.inbound.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Transfers {
    pub fn new(mtu: usize, config: TransferConfig) -> Result<Self> {
        if mtu < MIN_MTU {
            return Err(ProtocolError::Framing(constants::ERR_MTU_TOO_SMALL));
        }
        Ok(Self {
            mtu,
            config,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Payload bytes carried by each chunk part
    pub fn chunk_capacity(&self) -> usize {
        self.mtu.saturating_sub(CHUNK_INDEX_LEN)
    }

    /// Whether a payload of `len` bytes needs a chunked transfer
    pub fn needs_chunking(&self, len: usize) -> bool {
        len > self.mtu
    }

    pub fn is_sending(&self, channel: Channel) -> bool {
        self.outbound.contains_key(&channel)
    }

    pub fn is_receiving(&self, channel: Channel) -> bool {
        self.inbound.contains_key(&channel)
    }

    /// Channel whose outbound transfer carries request `id`
    pub fn outbound_channel(&self, id: RequestId) -> Option<Channel> {
        self.outbound
            .iter()
            .find(|(_, transfer)| transfer.origin == Some(id))
            .map(|(channel, _)| *channel)
    }

    /// Start sending `payload` (already sealed if `encrypted`) on `channel`
    pub fn begin_outbound(
        &mut self,
        channel: Channel,
        payload: Bytes,
        encrypted: bool,
        origin: Option<RequestId>,
    ) -> Result<Vec<ChunkOutput>> {
        let capacity = self.chunk_capacity();
        if capacity == 0 {
            return Err(ProtocolError::Framing(constants::ERR_MTU_TOO_SMALL));
        }
        let chunks = split(&payload, capacity);
        if chunks.len() > u16::MAX as usize {
            return Err(ProtocolError::TransferAbandoned(constants::ERR_TOO_MANY_CHUNKS));
        }

        let mut out = Vec::new();
        if let Some(previous) = self.outbound.remove(&channel) {
            warn!(%channel, "replacing unfinished outbound transfer");
            global_metrics().transfer_abandoned();
            out.push(ChunkOutput::Abandoned {
                channel,
                direction: Direction::Outbound,
                origin: previous.origin,
                reason: constants::ERR_RESTART_REQUESTED,
            });
        }

        debug!(%channel, len = payload.len(), chunks = chunks.len(), encrypted, "starting outbound transfer");
        global_metrics().transfer_started();
        let transfer = OutboundTransfer {
            payload,
            chunks,
            encrypted,
            phase: OutboundPhase::AwaitingStartAck,
            restarts: 0,
            origin,
        };
        out.push(ChunkOutput::Send {
            channel,
            payload: transfer.start_message(),
            origin,
        });
        out.push(self.arm(channel, Direction::Outbound));
        self.outbound.insert(channel, transfer);
        Ok(out)
    }

    /// Handle a received Chunk frame payload
    pub fn on_chunk_frame(&mut self, channel: Channel, payload: &Bytes) -> Result<Vec<ChunkOutput>> {
        let message = ChunkMessage::decode(payload)?;
        trace!(%channel, ?message, "chunk message");
        Ok(match message {
            ChunkMessage::Start { count, encrypted } => self.on_start(channel, count, encrypted),
            ChunkMessage::Part { index, data } => self.on_part(channel, index, data),
            ChunkMessage::StartAck => self.on_start_ack(channel),
            ChunkMessage::EndAck => self.on_end_ack(channel),
            ChunkMessage::Missing(indices) => self.on_missing(channel, indices),
        })
    }

    /// The inbound inactivity timer for `channel` fired
    pub fn on_inbound_timeout(&mut self, channel: Channel) -> Vec<ChunkOutput> {
        let Some(transfer) = self.inbound.get_mut(&channel) else {
            return Vec::new();
        };

        if transfer.missing_rounds >= self.config.max_missing_requests {
            warn!(%channel, rounds = transfer.missing_rounds, "giving up on inbound transfer");
            self.inbound.remove(&channel);
            global_metrics().transfer_abandoned();
            return vec![
                ChunkOutput::Send {
                    channel,
                    payload: ChunkMessage::Missing(Vec::new()).encode(),
                    origin: None,
                },
                ChunkOutput::Abandoned {
                    channel,
                    direction: Direction::Inbound,
                    origin: None,
                    reason: constants::ERR_MISSING_RETRIES,
                },
            ];
        }

        transfer.missing_rounds += 1;
        let limit = (self.mtu.saturating_sub(MISSING_HEADER_LEN) / 2).clamp(1, u8::MAX as usize);
        let mut missing = transfer.missing();
        missing.truncate(limit);
        debug!(%channel, round = transfer.missing_rounds, count = missing.len(), "requesting missing chunks");
        global_metrics().missing_request();

        vec![
            ChunkOutput::Send {
                channel,
                payload: ChunkMessage::Missing(missing).encode(),
                origin: None,
            },
            self.arm(channel, Direction::Inbound),
        ]
    }

    /// The outbound ack timer for `channel` fired
    pub fn on_outbound_timeout(&mut self, channel: Channel) -> Vec<ChunkOutput> {
        if !self.outbound.contains_key(&channel) {
            return Vec::new();
        }
        debug!(%channel, "outbound transfer ack timed out");
        self.restart_outbound(channel, constants::ERR_START_RETRIES)
    }

    /// Change the MTU; active outbound transfers restart from "start"
    pub fn set_mtu(&mut self, mtu: usize) -> Result<Vec<ChunkOutput>> {
        if mtu < MIN_MTU {
            return Err(ProtocolError::Framing(constants::ERR_MTU_TOO_SMALL));
        }
        if mtu == self.mtu {
            return Ok(Vec::new());
        }
        info!(old = self.mtu, new = mtu, "MTU changed");
        self.mtu = mtu;

        let capacity = self.chunk_capacity();
        let mut channels: Vec<Channel> = self.outbound.keys().copied().collect();
        channels.sort();

        let mut out = Vec::new();
        for channel in channels {
            let Some(transfer) = self.outbound.get_mut(&channel) else {
                continue;
            };
            let chunks = split(&transfer.payload, capacity);
            if chunks.len() > u16::MAX as usize {
                out.extend(self.abandon_outbound(channel, constants::ERR_TOO_MANY_CHUNKS));
                continue;
            }
            debug!(%channel, chunks = chunks.len(), "restarting outbound transfer for new MTU");
            transfer.chunks = chunks;
            transfer.phase = OutboundPhase::AwaitingStartAck;
            out.push(ChunkOutput::Send {
                channel,
                payload: transfer.start_message(),
                origin: transfer.origin,
            });
            out.push(self.arm(channel, Direction::Outbound));
        }
        Ok(out)
    }

    /// Give up on the outbound transfer on `channel`
    pub fn abort_outbound(&mut self, channel: Channel, reason: &'static str) -> Vec<ChunkOutput> {
        self.abandon_outbound(channel, reason)
    }

    /// Drop every transfer, reporting the ones that were active
    pub fn clear(&mut self) -> Vec<ChunkOutput> {
        let mut out = Vec::new();
        for (channel, transfer) in self.outbound.drain() {
            global_metrics().transfer_abandoned();
            out.push(ChunkOutput::Abandoned {
                channel,
                direction: Direction::Outbound,
                origin: transfer.origin,
                reason: constants::ERR_CONNECTION_CLOSED,
            });
        }
        for (channel, _) in self.inbound.drain() {
            global_metrics().transfer_abandoned();
            out.push(ChunkOutput::Abandoned {
                channel,
                direction: Direction::Inbound,
                origin: None,
                reason: constants::ERR_CONNECTION_CLOSED,
            });
        }
        out
    }

    fn arm(&self, channel: Channel, direction: Direction) -> ChunkOutput {
        let after = match direction {
            Direction::Inbound => self.config.chunk_inactivity_timeout,
            Direction::Outbound => self.config.chunk_ack_timeout,
        };
        ChunkOutput::ArmTimer {
            channel,
            direction,
            after,
        }
    }

    fn on_start(&mut self, channel: Channel, count: u16, encrypted: bool) -> Vec<ChunkOutput> {
        if self.inbound.contains_key(&channel) {
            warn!(%channel, "new transfer started before the previous one finished");
        }
        debug!(%channel, count, encrypted, "inbound transfer announced");
        global_metrics().transfer_started();

        self.inbound.insert(
            channel,
            InboundTransfer {
                slots: vec![None; usize::from(count)],
                received: 0,
                encrypted,
                missing_rounds: 0,
                last_percent: 0,
            },
        );

        let mut out = vec![ChunkOutput::Send {
            channel,
            payload: ChunkMessage::StartAck.encode(),
            origin: None,
        }];
        if count == 0 {
            out.extend(self.finish_inbound(channel));
        } else {
            out.push(self.arm(channel, Direction::Inbound));
        }
        out
    }

    fn on_part(&mut self, channel: Channel, index: u16, data: Bytes) -> Vec<ChunkOutput> {
        let Some(transfer) = self.inbound.get_mut(&channel) else {
            warn!(%channel, index, "chunk without an active transfer, requesting restart");
            return vec![ChunkOutput::Send {
                channel,
                payload: ChunkMessage::Missing(Vec::new()).encode(),
                origin: None,
            }];
        };

        let total = transfer.slots.len();
        let Some(slot) = transfer.slots.get_mut(usize::from(index) - 1) else {
            warn!(%channel, index, total, "chunk index out of range, ignoring");
            return Vec::new();
        };
        if slot.is_some() {
            warn!(%channel, index, "duplicate chunk, keeping the first copy");
            return Vec::new();
        }
        *slot = Some(data);
        transfer.received += 1;

        let mut out = Vec::new();
        let now = percent(transfer.received, total);
        if now > transfer.last_percent {
            transfer.last_percent = now;
            out.push(ChunkOutput::Progress {
                channel,
                direction: Direction::Inbound,
                percent: now,
            });
        }

        if transfer.is_complete() {
            out.extend(self.finish_inbound(channel));
        } else {
            out.push(self.arm(channel, Direction::Inbound));
        }
        out
    }

    fn finish_inbound(&mut self, channel: Channel) -> Vec<ChunkOutput> {
        let Some(transfer) = self.inbound.remove(&channel) else {
            return Vec::new();
        };
        let payload = transfer.assemble();
        debug!(%channel, len = payload.len(), "inbound transfer complete");
        global_metrics().transfer_completed();

        vec![
            ChunkOutput::CancelTimer {
                channel,
                direction: Direction::Inbound,
            },
            ChunkOutput::Send {
                channel,
                payload: ChunkMessage::EndAck.encode(),
                origin: None,
            },
            ChunkOutput::Completed {
                channel,
                direction: Direction::Inbound,
                origin: None,
            },
            ChunkOutput::Delivered {
                channel,
                payload,
                encrypted: transfer.encrypted,
            },
        ]
    }

    fn on_start_ack(&mut self, channel: Channel) -> Vec<ChunkOutput> {
        let Some(transfer) = self.outbound.get_mut(&channel) else {
            debug!(%channel, "start-ack without an outbound transfer");
            return Vec::new();
        };
        if transfer.phase != OutboundPhase::AwaitingStartAck {
            debug!(%channel, "duplicate start-ack ignored");
            return Vec::new();
        }
        transfer.phase = OutboundPhase::AwaitingEndAck;

        let total = transfer.chunks.len();
        let mut out = Vec::with_capacity(total * 2 + 1);
        let mut last_percent = 0;
        for index in 1..=total as u16 {
            if let Some(part) = transfer.part(index) {
                out.push(ChunkOutput::Send {
                    channel,
                    payload: part,
                    origin: transfer.origin,
                });
            }
            let now = percent(usize::from(index), total);
            if now > last_percent {
                last_percent = now;
                out.push(ChunkOutput::Progress {
                    channel,
                    direction: Direction::Outbound,
                    percent: now,
                });
            }
        }
        out.push(self.arm(channel, Direction::Outbound));
        out
    }

    fn on_end_ack(&mut self, channel: Channel) -> Vec<ChunkOutput> {
        let Some(transfer) = self.outbound.remove(&channel) else {
            debug!(%channel, "end-ack without an outbound transfer");
            return Vec::new();
        };
        debug!(%channel, len = transfer.payload.len(), "outbound transfer acknowledged");
        global_metrics().transfer_completed();
        vec![
            ChunkOutput::CancelTimer {
                channel,
                direction: Direction::Outbound,
            },
            ChunkOutput::Completed {
                channel,
                direction: Direction::Outbound,
                origin: transfer.origin,
            },
        ]
    }

    fn on_missing(&mut self, channel: Channel, indices: Vec<u16>) -> Vec<ChunkOutput> {
        let Some(transfer) = self.outbound.get(&channel) else {
            debug!(%channel, "missing-request without an outbound transfer");
            return Vec::new();
        };

        if indices.is_empty() {
            info!(%channel, "receiver asked to restart the transfer");
            return self.restart_outbound(channel, constants::ERR_RESTART_REQUESTED);
        }

        debug!(%channel, count = indices.len(), "resending missing chunks");
        let mut out: Vec<ChunkOutput> = indices
            .iter()
            .filter_map(|&index| match transfer.part(index) {
                Some(payload) => Some(ChunkOutput::Send {
                    channel,
                    payload,
                    origin: transfer.origin,
                }),
                None => {
                    warn!(%channel, index, "receiver asked for a chunk that does not exist");
                    None
                }
            })
            .collect();
        out.push(self.arm(channel, Direction::Outbound));
        out
    }

    fn restart_outbound(&mut self, channel: Channel, reason: &'static str) -> Vec<ChunkOutput> {
        let max_restarts = self.config.max_transfer_restarts;
        let Some(transfer) = self.outbound.get_mut(&channel) else {
            return Vec::new();
        };
        if transfer.restarts >= max_restarts {
            return self.abandon_outbound(channel, reason);
        }
        transfer.restarts += 1;
        transfer.phase = OutboundPhase::AwaitingStartAck;
        debug!(%channel, attempt = transfer.restarts, "restarting outbound transfer");
        let start = transfer.start_message();
        let origin = transfer.origin;
        vec![
            ChunkOutput::Send {
                channel,
                payload: start,
                origin,
            },
            self.arm(channel, Direction::Outbound),
        ]
    }

    fn abandon_outbound(&mut self, channel: Channel, reason: &'static str) -> Vec<ChunkOutput> {
        let Some(transfer) = self.outbound.remove(&channel) else {
            return Vec::new();
        };
        warn!(%channel, reason, "abandoning outbound transfer");
        global_metrics().transfer_abandoned();
        vec![
            ChunkOutput::CancelTimer {
                channel,
                direction: Direction::Outbound,
            },
            ChunkOutput::Abandoned {
                channel,
                direction: Direction::Outbound,
                origin: transfer.origin,
                reason,
            },
        ]
    }
}
