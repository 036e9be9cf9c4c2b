//! Per-connection link state machine.
//!
//! [`Link`] owns everything one connection needs: the frame codec, the
//! secure session, chunked transfers, the request dispatcher and the
//! per-channel send queues. It performs no I/O. Callers feed it received
//! bytes, timer expirations and write results, and drain [`Action`]s that
//! tell them what to write, which timers to (re)arm and which events to
//! publish. All processing for a connection happens in one context, so the
//! link needs no locks.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::LinkConfig;
use crate::core::codec::{FrameCodec, WireFormatKind};
use crate::core::frame::{Channel, Frame, FrameFlags, FrameType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::chunking::{ChunkOutput, Direction, Transfers};
use crate::protocol::command::{Command, CommandCodec, EventSink, TaggedCommandCodec};
use crate::protocol::credentials::CredentialStore;
use crate::protocol::dispatcher::{Dispatch, Dispatcher, Request, RequestId, SendOutcome};
use crate::protocol::message::{DeviceInfo, HandshakeMessage, AUTH_CATEGORY};
use crate::protocol::session::{Role, Session, SessionState};
use crate::protocol::session_config::{SessionConfigMessage, SessionParams};
use crate::utils::metrics::global_metrics;

/// Version announced in the sealed device info
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifies one pending timer; arming a key replaces its previous timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Handshake,
    InboundTransfer(Channel),
    OutboundTransfer(Channel),
    Request(RequestId),
}

impl TimerKey {
    fn transfer(channel: Channel, direction: Direction) -> Self {
        match direction {
            Direction::Inbound => TimerKey::InboundTransfer(channel),
            Direction::Outbound => TimerKey::OutboundTransfer(channel),
        }
    }
}

/// Notifications for the connection's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    SessionStateChanged(SessionState),
    /// Session parameters the peer announced (Crc16 format only)
    SessionConfigured(SessionParams),
    HandshakeFailed { reason: String },
    /// Metadata the initiator sent during the handshake
    PeerAuthenticated(DeviceInfo),
    /// Consecutive payloads failed to decrypt
    SessionDegraded { consecutive_failures: u32 },
    TransferProgress {
        channel: Channel,
        direction: Direction,
        percent: u8,
    },
    TransferAbandoned {
        channel: Channel,
        direction: Direction,
        reason: &'static str,
    },
    /// A command no pending request claimed and no sink was installed
    Unsolicited(Command),
    /// A non-command payload and no sink was installed
    Raw { channel: Channel, payload: Bytes },
    SendFailuresRepeated { consecutive: u32 },
    PeerClosed,
}

/// Work the caller must perform for the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write `bytes` to the transport, then report the result through
    /// [`Link::on_transmit_complete`] or [`Link::on_transmit_failed`]
    Transmit {
        bytes: Bytes,
        origin: Option<RequestId>,
    },
    ArmTimer { key: TimerKey, after: Duration },
    CancelTimer(TimerKey),
    Event(LinkEvent),
    /// The link is finished; close the transport
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Initiator waiting for the session config response
    Configuring,
    Active,
    Closed,
}

struct Outgoing {
    payload: Bytes,
    origin: RequestId,
}

pub struct Link {
    config: LinkConfig,
    credentials: Arc<dyn CredentialStore>,
    local_info: DeviceInfo,
    codec: FrameCodec,
    inbound: BytesMut,
    session: Session,
    reported_state: SessionState,
    session_params: Option<SessionParams>,
    transfers: Transfers,
    dispatcher: Dispatcher,
    command_codec: Box<dyn CommandCodec>,
    sink: Option<Box<dyn EventSink>>,
    queues: BTreeMap<Channel, VecDeque<Outgoing>>,
    timers: HashSet<TimerKey>,
    actions: VecDeque<Action>,
    sequence: u8,
    phase: Phase,
    send_failures: u32,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("role", &self.session.role())
            .field("phase", &self.phase)
            .field("session", &self.session.state())
            .field("pending_requests", &self.dispatcher.len())
            .field("queued_actions", &self.actions.len())
            .finish()
    }
}

impl Link {
    /// Build a link for one connection. Fails when `config` does not pass
    /// validation (advisories such as plaintext mode are only logged).
    pub fn new(config: LinkConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        config.ensure_usable()?;
        let local_info = DeviceInfo {
            identifier: credentials.local_identifier(),
            name: config.session.device_name.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        Ok(Self {
            codec: FrameCodec::new(config.link.wire_format, config.link.max_frame_payload),
            session: Session::new(config.link.role, config.session.auth_mode),
            transfers: Transfers::new(config.link.mtu, config.transfer.clone())?,
            dispatcher: Dispatcher::new(config.requests.default_timeout),
            command_codec: Box::new(TaggedCommandCodec),
            sink: None,
            inbound: BytesMut::with_capacity(config.link.mtu * 2),
            reported_state: SessionState::Unauthenticated,
            session_params: None,
            queues: BTreeMap::new(),
            timers: HashSet::new(),
            actions: VecDeque::new(),
            sequence: 0,
            phase: Phase::Idle,
            send_failures: 0,
            local_info,
            credentials,
            config,
        })
    }

    /// Replace the default [`TaggedCommandCodec`]
    pub fn with_command_codec(mut self, codec: impl CommandCodec + 'static) -> Self {
        self.command_codec = Box::new(codec);
        self
    }

    /// Route unmatched traffic to `sink` instead of [`LinkEvent`]s
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_params(&self) -> Option<SessionParams> {
        self.session_params
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn pending_requests(&self) -> usize {
        self.dispatcher.len()
    }

    pub fn mtu(&self) -> usize {
        self.transfers.mtu()
    }

    /// Next action for the caller, if any
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Open the connection. The initiator sends the session config request
    /// (Crc16) or its first handshake message; the responder waits.
    #[instrument(skip(self), fields(role = ?self.session.role()))]
    pub fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        self.phase = Phase::Active;
        if self.session.role() == Role::Responder {
            debug!("waiting for initiator");
            return Ok(());
        }

        self.arm_timer(TimerKey::Handshake, self.config.session.handshake_timeout);
        if self.codec.kind() == WireFormatKind::Crc16 {
            self.phase = Phase::Configuring;
            let request = SessionConfigMessage::StartRequest(self.local_params()).encode();
            debug!("sending session config request");
            self.emit_frame(Frame::session_config(0, request), None)
        } else {
            self.begin_handshake()
        }
    }

    /// Feed bytes read from the transport
    pub fn on_bytes_received(&mut self, bytes: &[u8]) {
        if self.phase == Phase::Closed {
            trace!(len = bytes.len(), "ignoring bytes after close");
            return;
        }
        global_metrics().bytes_received(bytes.len() as u64);
        self.inbound.extend_from_slice(bytes);

        let resyncs_before = self.codec.resyncs();
        loop {
            match self.codec.decode(&mut self.inbound) {
                Ok(Some(frame)) => {
                    global_metrics().frame_received();
                    self.on_frame(frame);
                    if self.phase == Phase::Closed {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "frame decoder failed");
                    self.inbound.clear();
                    break;
                }
            }
        }
        let resyncs = self.codec.resyncs() - resyncs_before;
        if resyncs > 0 {
            global_metrics().resync(resyncs);
        }
    }

    /// Queue an already-serialized payload with no response expected
    pub fn send(&mut self, channel: Channel, payload: impl Into<Bytes>) -> RequestId {
        self.submit(Request::new(channel, payload))
    }

    /// Queue a request. Payloads are held until the session is established
    /// and go out in submission order per channel.
    pub fn submit(&mut self, request: Request) -> RequestId {
        let channel = request.channel();
        let payload = request.payload().clone();
        let id = self.dispatcher.submit(request);

        if self.phase == Phase::Closed {
            self.dispatcher.fail(id, &ProtocolError::Disconnected);
            return id;
        }

        self.queues.entry(channel).or_default().push_back(Outgoing {
            payload,
            origin: id,
        });
        self.pump(channel);
        id
    }

    /// A timer armed through [`Action::ArmTimer`] expired
    pub fn on_timer(&mut self, key: TimerKey) {
        if !self.timers.remove(&key) {
            trace!(?key, "ignoring stale timer");
            return;
        }
        match key {
            TimerKey::Handshake => self.on_handshake_timeout(),
            TimerKey::InboundTransfer(channel) => {
                let outputs = self.transfers.on_inbound_timeout(channel);
                self.apply_chunk_outputs(outputs);
            }
            TimerKey::OutboundTransfer(channel) => {
                let outputs = self.transfers.on_outbound_timeout(channel);
                self.apply_chunk_outputs(outputs);
            }
            TimerKey::Request(id) => {
                if let Some(next) = self.dispatcher.on_timeout(id) {
                    self.submit(next);
                }
            }
        }
    }

    /// A [`Action::Transmit`] was written successfully
    pub fn on_transmit_complete(&mut self, origin: Option<RequestId>, len: usize) {
        global_metrics().frame_sent(len as u64);
        self.send_failures = 0;
        let Some(id) = origin else {
            return;
        };
        // a chunked request counts as sent once the receiver acknowledges the end
        if self.transfers.outbound_channel(id).is_none() {
            self.request_transmitted(id);
        }
    }

    /// A [`Action::Transmit`] could not be written
    pub fn on_transmit_failed(&mut self, origin: Option<RequestId>, error: &ProtocolError) {
        global_metrics().send_failure();
        self.send_failures += 1;
        warn!(%error, consecutive = self.send_failures, "transport write failed");

        if self.send_failures == self.config.requests.send_failure_threshold {
            self.push_event(LinkEvent::SendFailuresRepeated {
                consecutive: self.send_failures,
            });
        }
        let Some(id) = origin else {
            return;
        };
        self.dispatcher
            .fail(id, &ProtocolError::SendFailed(error.to_string()));
        if let Some(channel) = self.transfers.outbound_channel(id) {
            let outputs = self.transfers.abort_outbound(channel, constants::ERR_SEND_FAILED);
            self.apply_chunk_outputs(outputs);
        }
    }

    /// Change the MTU; outbound chunked transfers restart
    pub fn set_mtu(&mut self, mtu: usize) -> Result<()> {
        let outputs = self.transfers.set_mtu(mtu)?;
        self.apply_chunk_outputs(outputs);
        Ok(())
    }

    /// Tear the connection down: cancel timers, fail every pending request
    /// with `Disconnected` and discard transfers.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        info!("shutting down link");
        if self.codec.kind() == WireFormatKind::Crc16 && self.session_params.is_some() {
            let stop = SessionConfigMessage::StopRequest.encode();
            if let Err(e) = self.emit_frame(Frame::session_config(0, stop), None) {
                debug!(error = %e, "could not send session stop request");
            }
        }
        self.teardown();
    }

    /// The transport reached end of stream
    pub fn on_transport_closed(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        info!("transport closed by peer");
        self.push_event(LinkEvent::PeerClosed);
        self.teardown();
    }

    fn teardown(&mut self) {
        self.phase = Phase::Closed;
        for key in self.timers.drain().collect::<Vec<_>>() {
            self.actions.push_back(Action::CancelTimer(key));
        }
        let abandoned = self.transfers.clear();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "discarded active transfers");
        }
        self.queues.clear();
        let failed = self.dispatcher.fail_all(|| ProtocolError::Disconnected);
        if !failed.is_empty() {
            debug!(count = failed.len(), "failed pending requests on teardown");
        }
        self.session.reset();
        self.report_state();
        self.actions.push_back(Action::Close);
    }

    fn local_params(&self) -> SessionParams {
        SessionParams {
            max_packet_size: self.config.link.max_frame_payload.min(u16::MAX as usize) as u16,
            send_timeout: self.config.link.send_timeout.as_millis().min(u16::MAX as u128) as u16,
            ..SessionParams::default()
        }
    }

    fn begin_handshake(&mut self) -> Result<()> {
        let message = self.session.begin(self.credentials.as_ref())?;
        self.send_handshake(&message)?;
        if self.session.is_established() {
            self.on_established();
        } else {
            self.report_state();
        }
        Ok(())
    }

    fn on_handshake_timeout(&mut self) {
        if self.session.is_established() {
            return;
        }
        warn!(state = %self.session.state(), "handshake timed out");
        self.session.fail();
        self.report_state();
        self.push_event(LinkEvent::HandshakeFailed {
            reason: ProtocolError::HandshakeTimeout.to_string(),
        });
        self.queues.clear();
        self.dispatcher.fail_all(|| ProtocolError::HandshakeTimeout);
    }

    fn on_established(&mut self) {
        self.cancel_timer(TimerKey::Handshake);
        self.report_state();
        if let Some(peer) = self.session.peer().cloned() {
            self.push_event(LinkEvent::PeerAuthenticated(peer));
        }
        let channels: Vec<Channel> = self.queues.keys().copied().collect();
        for channel in channels {
            self.pump(channel);
        }
    }

    fn report_state(&mut self) {
        let state = self.session.state();
        if state != self.reported_state {
            self.reported_state = state;
            self.push_event(LinkEvent::SessionStateChanged(state));
        }
    }

    fn push_event(&mut self, event: LinkEvent) {
        self.actions.push_back(Action::Event(event));
    }

    fn arm_timer(&mut self, key: TimerKey, after: Duration) {
        self.timers.insert(key);
        self.actions.push_back(Action::ArmTimer { key, after });
    }

    fn cancel_timer(&mut self, key: TimerKey) {
        if self.timers.remove(&key) {
            self.actions.push_back(Action::CancelTimer(key));
        }
    }

    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    /// Encode `frame` with the next sequence number and queue its write
    fn emit_frame(&mut self, mut frame: Frame, origin: Option<RequestId>) -> Result<()> {
        frame.sequence = self.next_sequence();
        let bytes = self.codec.encode_frame(&frame)?.freeze();
        trace!(%frame, len = bytes.len(), "queueing frame");
        self.actions.push_back(Action::Transmit { bytes, origin });
        Ok(())
    }

    /// Send one payload on `channel`, sealing it when the session encrypts
    /// and chunking it when it exceeds the MTU.
    fn transmit_payload(
        &mut self,
        channel: Channel,
        payload: Bytes,
        origin: Option<RequestId>,
        allow_encryption: bool,
    ) -> Result<()> {
        let encrypt = allow_encryption && channel != Channel::Version && self.session.is_encrypting();
        let body = if encrypt {
            self.session.seal(&payload)?
        } else {
            payload
        };

        if self.transfers.needs_chunking(body.len()) {
            let outputs = self.transfers.begin_outbound(channel, body, encrypt, origin)?;
            self.apply_chunk_outputs(outputs);
            return Ok(());
        }

        let flags = FrameFlags {
            encrypted: encrypt,
            needs_response: self.config.link.request_acks,
        };
        self.emit_frame(Frame::data(channel, 0, flags, body), origin)
    }

    fn send_handshake(&mut self, message: &HandshakeMessage) -> Result<()> {
        let command = message.to_command()?;
        let payload = self.command_codec.encode(&command)?;
        debug!(step = message.subtype(), "sending handshake message");
        self.transmit_payload(Channel::Command, payload, None, false)
    }

    /// Drain `channel`'s queue until it empties or a chunked transfer blocks it
    fn pump(&mut self, channel: Channel) {
        if !self.session.is_established() || self.phase == Phase::Closed {
            return;
        }
        while !self.transfers.is_sending(channel) {
            let Some(next) = self.queues.get_mut(&channel).and_then(VecDeque::pop_front) else {
                break;
            };
            if let Err(e) = self.transmit_payload(channel, next.payload, Some(next.origin), true) {
                error!(%channel, error = %e, "could not send payload");
                self.dispatcher.fail(next.origin, &e);
            }
        }
    }

    fn request_transmitted(&mut self, id: RequestId) {
        match self.dispatcher.mark_sent(id) {
            SendOutcome::Awaiting { timeout } => self.arm_timer(TimerKey::Request(id), timeout),
            SendOutcome::Finished { next: Some(next) } => {
                self.submit(next);
            }
            SendOutcome::Finished { next: None } | SendOutcome::Unknown => {}
        }
    }

    fn apply_chunk_outputs(&mut self, outputs: Vec<ChunkOutput>) {
        for output in outputs {
            match output {
                ChunkOutput::Send {
                    channel,
                    payload,
                    origin,
                } => {
                    if let Err(e) = self.emit_frame(Frame::chunk(channel, 0, payload), origin) {
                        error!(%channel, error = %e, "could not encode chunk frame");
                    }
                }
                ChunkOutput::ArmTimer {
                    channel,
                    direction,
                    after,
                } => self.arm_timer(TimerKey::transfer(channel, direction), after),
                ChunkOutput::CancelTimer { channel, direction } => {
                    self.cancel_timer(TimerKey::transfer(channel, direction))
                }
                ChunkOutput::Delivered {
                    channel,
                    payload,
                    encrypted,
                } => self.on_payload(channel, payload, encrypted),
                ChunkOutput::Progress {
                    channel,
                    direction,
                    percent,
                } => self.push_event(LinkEvent::TransferProgress {
                    channel,
                    direction,
                    percent,
                }),
                ChunkOutput::Completed {
                    channel,
                    direction,
                    origin,
                } => {
                    if direction == Direction::Outbound {
                        if let Some(id) = origin {
                            self.request_transmitted(id);
                        }
                        self.pump(channel);
                    }
                }
                ChunkOutput::Abandoned {
                    channel,
                    direction,
                    origin,
                    reason,
                } => {
                    self.push_event(LinkEvent::TransferAbandoned {
                        channel,
                        direction,
                        reason,
                    });
                    if let Some(id) = origin {
                        self.dispatcher
                            .fail(id, &ProtocolError::TransferAbandoned(reason));
                    }
                    if direction == Direction::Outbound {
                        self.pump(channel);
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame.frame_type {
            FrameType::Ack => trace!(sequence = frame.sequence, "peer acknowledged frame"),
            FrameType::SessionConfig => self.on_session_config(&frame.payload),
            FrameType::Data => {
                if frame.flags.needs_response {
                    self.emit_ack(frame.sequence);
                }
                self.on_payload(frame.channel, frame.payload, frame.flags.encrypted);
            }
            FrameType::Chunk => match self.transfers.on_chunk_frame(frame.channel, &frame.payload) {
                Ok(outputs) => self.apply_chunk_outputs(outputs),
                Err(e) => warn!(channel = %frame.channel, error = %e, "dropping malformed chunk frame"),
            },
        }
    }

    /// Acks echo the acknowledged sequence number instead of taking a fresh one
    fn emit_ack(&mut self, sequence: u8) {
        match self.codec.encode_frame(&Frame::ack(sequence)) {
            Ok(bytes) => self.actions.push_back(Action::Transmit {
                bytes: bytes.freeze(),
                origin: None,
            }),
            Err(e) => warn!(sequence, error = %e, "could not acknowledge frame"),
        }
    }

    fn on_session_config(&mut self, payload: &[u8]) {
        let message = match SessionConfigMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed session config");
                return;
            }
        };
        debug!(?message, "session config");

        match message {
            SessionConfigMessage::StartRequest(params) => {
                self.session_params = Some(params);
                self.push_event(LinkEvent::SessionConfigured(params));
                let response = SessionConfigMessage::StartResponse(self.local_params()).encode();
                if let Err(e) = self.emit_frame(Frame::session_config(0, response), None) {
                    warn!(error = %e, "could not answer session config");
                }
            }
            SessionConfigMessage::StartResponse(params) => {
                if self.phase != Phase::Configuring {
                    debug!("unsolicited session config response");
                    return;
                }
                self.phase = Phase::Active;
                self.session_params = Some(params);
                self.push_event(LinkEvent::SessionConfigured(params));
                if let Err(e) = self.begin_handshake() {
                    error!(error = %e, "could not start handshake");
                    self.session.fail();
                    self.report_state();
                    self.push_event(LinkEvent::HandshakeFailed {
                        reason: e.to_string(),
                    });
                }
            }
            SessionConfigMessage::StopRequest => {
                let response = SessionConfigMessage::StopResponse.encode();
                if let Err(e) = self.emit_frame(Frame::session_config(0, response), None) {
                    debug!(error = %e, "could not answer session stop");
                }
                self.push_event(LinkEvent::PeerClosed);
                self.teardown();
            }
            SessionConfigMessage::StopResponse => debug!("peer confirmed session stop"),
        }
    }

    /// A complete channel payload, from a single Data frame or a finished
    /// chunked transfer
    fn on_payload(&mut self, channel: Channel, payload: Bytes, encrypted: bool) {
        let plaintext = if encrypted {
            if !self.session.is_encrypting() {
                warn!(%channel, "encrypted payload without session keys, dropping");
                return;
            }
            match self.session.open(&payload) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    let failures = self.session.integrity_failures();
                    warn!(%channel, error = %e, failures, "dropping payload that failed to open");
                    if failures == self.config.session.integrity_failure_threshold {
                        self.push_event(LinkEvent::SessionDegraded {
                            consecutive_failures: failures,
                        });
                    }
                    return;
                }
            }
        } else {
            payload
        };

        let command = match self.command_codec.decode(channel, &plaintext) {
            Ok(command) => command,
            Err(e) => {
                warn!(%channel, error = %e, "dropping undecodable payload");
                return;
            }
        };

        match command {
            Some(command)
                if command.category == AUTH_CATEGORY
                    && channel == Channel::Command
                    && !encrypted =>
            {
                self.on_handshake_command(&command)
            }
            Some(command) => {
                if !self.session.is_established() {
                    debug!(%command, "dropping command received before the session was established");
                    return;
                }
                self.on_command(command);
            }
            None => {
                if !self.session.is_established() {
                    debug!(%channel, "dropping payload received before the session was established");
                    return;
                }
                match self.sink.as_mut() {
                    Some(sink) => sink.on_raw(channel, plaintext),
                    None => self.push_event(LinkEvent::Raw {
                        channel,
                        payload: plaintext,
                    }),
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match self.dispatcher.on_command(&command) {
            Dispatch::Matched { id, next } => {
                self.cancel_timer(TimerKey::Request(id));
                if let Some(next) = next {
                    self.submit(next);
                }
            }
            Dispatch::Unmatched => match self.sink.as_mut() {
                Some(sink) => sink.on_command(command),
                None => self.push_event(LinkEvent::Unsolicited(command)),
            },
        }
    }

    fn on_handshake_command(&mut self, command: &Command) {
        let message = match HandshakeMessage::from_command(command) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed handshake message");
                return;
            }
        };

        let was_established = self.session.is_established();
        let result = self
            .session
            .on_handshake(message, self.credentials.as_ref(), &self.local_info);

        match result {
            Ok(outcome) => {
                if was_established && !self.session.is_established() {
                    info!("session renegotiated; dropping transfers from the old session");
                    let outputs = self.transfers.clear();
                    self.apply_chunk_outputs(outputs);
                }
                if self.session.state() == SessionState::HandshakeInProgress
                    && self.session.role() == Role::Responder
                {
                    self.arm_timer(TimerKey::Handshake, self.config.session.handshake_timeout);
                }
                if let Some(reply) = outcome.reply {
                    if let Err(e) = self.send_handshake(&reply) {
                        error!(error = %e, "could not send handshake reply");
                    }
                }
                if outcome.established {
                    self.on_established();
                } else {
                    self.report_state();
                }
            }
            Err(ProtocolError::AuthenticationFailed(reason)) => {
                if self.session.role() == Role::Responder {
                    let verdict = HandshakeMessage::Status { accepted: false };
                    if let Err(e) = self.send_handshake(&verdict) {
                        debug!(error = %e, "could not send rejection");
                    }
                }
                self.cancel_timer(TimerKey::Handshake);
                self.report_state();
                self.push_event(LinkEvent::HandshakeFailed {
                    reason: reason.to_string(),
                });
                self.queues.clear();
                self.dispatcher
                    .fail_all(|| ProtocolError::AuthenticationFailed(reason));
            }
            Err(e) => warn!(error = %e, "handshake message rejected"),
        }
    }
}
