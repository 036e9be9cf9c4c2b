// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::codec::Decoder;

use crate::config::{LinkConfig, MAX_FRAME_PAYLOAD};
use crate::core::codec::{FrameCodec, WireFormatKind};
use crate::core::frame::{Channel, Frame, FrameFlags, FrameType};
use crate::error::ProtocolError;
use crate::protocol::chunking::ChunkMessage;
use crate::protocol::command::{Command, CommandCodec, TaggedCommandCodec};
use crate::protocol::credentials::StaticCredentials;
use crate::protocol::dispatcher::{CommandMatcher, Request};
use crate::protocol::link::{Action, Link, LinkEvent, TimerKey};
use crate::protocol::session::{AuthMode, Role, SessionState};

struct Endpoint {
    link: Link,
    format: WireFormatKind,
    events: Vec<LinkEvent>,
    timers: HashMap<TimerKey, Duration>,
    sent: Vec<Frame>,
    closed: bool,
    /// Report every write as failed instead of delivering it
    writes_fail: bool,
}

impl Endpoint {
    fn new(role: Role, format: WireFormatKind, mode: AuthMode, mtu: usize, secret: [u8; 16]) -> Self {
        let config = LinkConfig::default_with_overrides(|c| {
            c.link.role = role;
            c.link.wire_format = format;
            c.link.mtu = mtu;
            c.session.auth_mode = mode;
        });
        let id = match role {
            Role::Initiator => "phone-1",
            Role::Responder => "band-1",
        };
        Self {
            link: Link::new(config, Arc::new(StaticCredentials::new(secret, id))).unwrap(),
            format,
            events: Vec::new(),
            timers: HashMap::new(),
            sent: Vec::new(),
            closed: false,
            writes_fail: false,
        }
    }

    /// Apply one action; returns bytes to deliver to the peer
    fn apply(&mut self, action: Action) -> Option<Bytes> {
        match action {
            Action::Transmit { bytes, origin } => {
                let mut codec = FrameCodec::new(self.format, MAX_FRAME_PAYLOAD);
                let frame = codec
                    .decode(&mut BytesMut::from(&bytes[..]))
                    .unwrap()
                    .expect("every transmit carries one whole frame");
                self.sent.push(frame);
                if self.writes_fail {
                    self.link.on_transmit_failed(origin, &ProtocolError::Disconnected);
                    return None;
                }
                self.link.on_transmit_complete(origin, bytes.len());
                Some(bytes)
            }
            Action::ArmTimer { key, after } => {
                self.timers.insert(key, after);
                None
            }
            Action::CancelTimer(key) => {
                self.timers.remove(&key);
                None
            }
            Action::Event(event) => {
                self.events.push(event);
                None
            }
            Action::Close => {
                self.closed = true;
                None
            }
        }
    }

    fn fire(&mut self, key: TimerKey) {
        assert!(self.timers.remove(&key).is_some(), "timer {key:?} not armed");
        self.link.on_timer(key);
    }

    fn request_timer(&self) -> TimerKey {
        *self
            .timers
            .keys()
            .find(|k| matches!(k, TimerKey::Request(_)))
            .expect("a request timer is armed")
    }

    fn unsolicited(&self) -> Vec<&Command> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Unsolicited(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }
}

type FrameFilter = Box<dyn FnMut(&Frame) -> bool>;

struct Harness {
    phone: Endpoint,
    band: Endpoint,
    /// Returns true for phone -> band frames that get lost
    drop_outbound: Option<FrameFilter>,
}

impl Harness {
    fn new(format: WireFormatKind, mode: AuthMode, mtu: usize) -> Self {
        Self::with_secrets(format, mode, mtu, [0x11; 16], [0x11; 16])
    }

    fn with_secrets(
        format: WireFormatKind,
        mode: AuthMode,
        mtu: usize,
        phone_secret: [u8; 16],
        band_secret: [u8; 16],
    ) -> Self {
        Self {
            phone: Endpoint::new(Role::Initiator, format, mode, mtu, phone_secret),
            band: Endpoint::new(Role::Responder, format, mode, mtu, band_secret),
            drop_outbound: None,
        }
    }

    fn connect(&mut self) {
        self.band.link.start().unwrap();
        self.phone.link.start().unwrap();
        self.pump();
    }

    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(action) = self.phone.link.poll_action() {
                progressed = true;
                if let Some(bytes) = self.phone.apply(action) {
                    let dropped = match (self.drop_outbound.as_mut(), self.phone.sent.last()) {
                        (Some(filter), Some(frame)) => filter(frame),
                        _ => false,
                    };
                    if !dropped {
                        self.band.link.on_bytes_received(&bytes);
                    }
                }
            }
            while let Some(action) = self.band.link.poll_action() {
                progressed = true;
                if let Some(bytes) = self.band.apply(action) {
                    self.phone.link.on_bytes_received(&bytes);
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

fn command_bytes(category: u16, subtype: u16, body: Vec<u8>) -> Bytes {
    TaggedCommandCodec
        .encode(&Command::new(category, subtype, body))
        .unwrap()
}

#[test]
fn test_handshake_over_both_wire_formats() {
    for format in [WireFormatKind::Crc16, WireFormatKind::Legacy] {
        let mut h = Harness::new(format, AuthMode::Encrypted, 244);
        h.connect();

        assert_eq!(h.phone.link.session_state(), SessionState::Established);
        assert_eq!(h.band.link.session_state(), SessionState::Established);
        assert!(h.band.events.iter().any(|e| matches!(
            e,
            LinkEvent::PeerAuthenticated(info) if info.identifier == "phone-1"
        )));
        assert!(h.phone.timers.is_empty(), "{format:?}: {:?}", h.phone.timers);
        assert!(h.band.timers.is_empty(), "{format:?}: {:?}", h.band.timers);

        let configured = h.phone.link.session_params().is_some();
        assert_eq!(configured, format == WireFormatKind::Crc16);
    }
}

#[test]
fn test_mismatched_secret_fails_handshake() {
    let mut h = Harness::with_secrets(
        WireFormatKind::Crc16,
        AuthMode::Encrypted,
        244,
        [0x11; 16],
        [0x22; 16],
    );
    h.phone.link.send(Channel::Command, command_bytes(3, 1, vec![]));
    h.connect();

    assert_eq!(h.phone.link.session_state(), SessionState::Failed);
    assert!(h
        .phone
        .events
        .iter()
        .any(|e| matches!(e, LinkEvent::HandshakeFailed { .. })));
    assert_eq!(h.phone.link.pending_requests(), 0);
    assert!(h.band.unsolicited().is_empty());
}

#[test]
fn test_plaintext_bootstrap_carries_traffic() {
    let mut h = Harness::new(WireFormatKind::Legacy, AuthMode::Plaintext, 244);
    h.connect();
    assert_eq!(h.band.link.session_state(), SessionState::Established);

    h.phone.link.send(Channel::Command, command_bytes(4, 2, vec![1, 2, 3]));
    h.pump();
    let received = h.band.unsolicited();
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].body[..], &[1, 2, 3]);
    assert!(h.phone.sent.iter().all(|f| !f.flags.encrypted));
}

#[test]
fn test_request_matches_response() {
    let mut h = Harness::new(WireFormatKind::Crc16, AuthMode::Encrypted, 244);
    h.connect();

    let reply = Arc::new(Mutex::new(None));
    let slot = reply.clone();
    h.phone.link.submit(
        Request::new(Channel::Command, command_bytes(8, 1, b"get".to_vec()))
            .expect(CommandMatcher::exact(8, 1))
            .on_complete(move |cmd| *slot.lock().unwrap() = Some(cmd.body.clone())),
    );
    h.pump();
    assert_eq!(h.band.unsolicited().len(), 1);
    assert!(h.phone.timers.keys().any(|k| matches!(k, TimerKey::Request(_))));

    h.band.link.send(Channel::Command, command_bytes(8, 1, b"value".to_vec()));
    h.pump();

    assert_eq!(reply.lock().unwrap().as_deref(), Some(&b"value"[..]));
    assert_eq!(h.phone.link.pending_requests(), 0);
    assert!(h.phone.timers.is_empty());
    assert!(h.phone.unsolicited().is_empty());
    assert!(h.phone.sent.iter().filter(|f| f.frame_type == FrameType::Data).any(|f| f.flags.encrypted));
}

#[test]
fn test_chunked_command_recovers_dropped_chunk() {
    // ================ 600-byte command, 185-byte chunk capacity ================
    let mut h = Harness::new(WireFormatKind::Crc16, AuthMode::Encrypted, 187);
    h.connect();

    let mut dropped = false;
    h.drop_outbound = Some(Box::new(move |frame: &Frame| {
        let is_third = frame.frame_type == FrameType::Chunk && frame.payload.starts_with(&[3, 0]);
        if is_third && !dropped {
            dropped = true;
            return true;
        }
        false
    }));

    let body = vec![0xAB; 596];
    h.phone.link.send(Channel::Command, command_bytes(9, 1, body.clone()));
    h.pump();

    let parts = h
        .phone
        .sent
        .iter()
        .filter(|f| f.frame_type == FrameType::Chunk && !f.payload.starts_with(&[0, 0]))
        .count();
    assert_eq!(parts, 4);
    assert!(h.band.unsolicited().is_empty());
    assert!(h.phone.timers.contains_key(&TimerKey::OutboundTransfer(Channel::Command)));

    // ================ inactivity timer asks for chunk 3 only ================
    h.band.fire(TimerKey::InboundTransfer(Channel::Command));
    h.pump();

    let missing = ChunkMessage::Missing(vec![3]).encode();
    let end_ack = ChunkMessage::EndAck.encode();
    assert!(h.band.sent.iter().any(|f| f.payload == missing));
    assert!(h.band.sent.iter().any(|f| f.payload == end_ack));

    let received = h.band.unsolicited();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].category, 9);
    assert_eq!(&received[0].body[..], &body[..]);

    assert_eq!(h.phone.link.pending_requests(), 0);
    assert!(!h.phone.timers.contains_key(&TimerKey::OutboundTransfer(Channel::Command)));
    assert!(h.phone.events.iter().any(|e| matches!(
        e,
        LinkEvent::TransferProgress { percent: 100, .. }
    )));
}

#[test]
fn test_failed_write_fails_chunked_request_at_once() {
    let mut h = Harness::new(WireFormatKind::Crc16, AuthMode::Encrypted, 64);
    h.connect();
    h.phone.writes_fail = true;

    let error = Arc::new(Mutex::new(None));
    let slot = error.clone();
    h.phone.link.submit(
        Request::new(Channel::Command, command_bytes(9, 1, vec![0x3C; 300]))
            .expect(CommandMatcher::exact(9, 1))
            .on_error(move |e| *slot.lock().unwrap() = Some(e.to_string()))
            .then(Request::new(Channel::Command, command_bytes(9, 2, vec![1]))),
    );
    h.pump();

    // only the transfer start was attempted; nothing reached the band
    let attempted: Vec<&Frame> = h.phone.sent.iter().filter(|f| f.frame_type == FrameType::Chunk).collect();
    assert_eq!(attempted.len(), 1);
    assert!(attempted[0].payload.starts_with(&[0, 0, 0, 1]));
    assert!(h.band.unsolicited().is_empty());

    let reported = error.lock().unwrap().clone().expect("on_error ran");
    assert!(reported.starts_with("Send failed"), "{reported}");
    assert_eq!(h.phone.link.pending_requests(), 0);
    assert!(!h.phone.timers.contains_key(&TimerKey::OutboundTransfer(Channel::Command)));
    assert!(h.phone.events.iter().any(|e| matches!(
        e,
        LinkEvent::TransferAbandoned { channel: Channel::Command, .. }
    )));

    // the channel is free again once writes recover
    h.phone.writes_fail = false;
    h.phone.link.send(Channel::Command, command_bytes(7, 7, vec![0x11; 200]));
    h.pump();
    let received = h.band.unsolicited();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].category, 7);
}

#[test]
fn test_request_chain_advances_past_timeout() {
    let mut h = Harness::new(WireFormatKind::Crc16, AuthMode::Encrypted, 244);
    h.connect();

    let log = Arc::new(Mutex::new(Vec::new()));
    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());

    let chain = Request::new(Channel::Command, command_bytes(10, 0, vec![]))
        .expect(CommandMatcher::category(10))
        .on_complete(move |_| l1.lock().unwrap().push("r1"))
        .then(
            Request::new(Channel::Command, command_bytes(11, 0, vec![]))
                .expect(CommandMatcher::category(11))
                .with_timeout(Duration::from_secs(1))
                .advance_on_timeout(true)
                .on_timeout(move || l2.lock().unwrap().push("r2-timeout")),
        )
        .then(
            Request::new(Channel::Command, command_bytes(12, 0, vec![]))
                .expect(CommandMatcher::category(12))
                .on_complete(move |_| l3.lock().unwrap().push("r3")),
        );
    h.phone.link.submit(chain);
    h.pump();

    // R1 answered
    h.band.link.send(Channel::Command, command_bytes(10, 0, vec![]));
    h.pump();
    assert_eq!(h.band.unsolicited().len(), 2);

    // R2 never answered
    let r2_timer = h.phone.request_timer();
    assert_eq!(h.phone.timers[&r2_timer], Duration::from_secs(1));
    h.phone.fire(r2_timer);
    h.pump();
    assert_eq!(h.band.unsolicited().len(), 3);

    // R3 answered
    h.band.link.send(Channel::Command, command_bytes(12, 0, vec![]));
    h.pump();

    assert_eq!(*log.lock().unwrap(), vec!["r1", "r2-timeout", "r3"]);
    let categories: Vec<u16> = h.band.unsolicited().iter().map(|c| c.category).collect();
    assert_eq!(categories, vec![10, 11, 12]);
    assert_eq!(h.phone.link.pending_requests(), 0);
}

#[test]
fn test_repeated_integrity_failures_degrade_session() {
    let mut h = Harness::new(WireFormatKind::Crc16, AuthMode::Encrypted, 244);
    h.connect();

    let forged = FrameCodec::crc16()
        .encode_frame(&Frame::data(
            Channel::Command,
            0,
            FrameFlags::encrypted(),
            vec![0x40, 0x00, 1, 2, 3, 4, 5, 6, 7, 8],
        ))
        .unwrap();
    for _ in 0..3 {
        h.band.link.on_bytes_received(&forged);
    }
    h.pump();

    assert!(h.band.events.contains(&LinkEvent::SessionDegraded {
        consecutive_failures: 3
    }));
    assert_eq!(h.band.link.session_state(), SessionState::Established);

    h.phone.link.send(Channel::Activity, Bytes::from_static(b"still fine"));
    h.pump();
    assert!(h.band.events.iter().any(|e| matches!(
        e,
        LinkEvent::Raw { channel: Channel::Activity, payload } if &payload[..] == b"still fine"
    )));
}

#[test]
fn test_shutdown_stops_peer_session() {
    let mut h = Harness::new(WireFormatKind::Crc16, AuthMode::Encrypted, 244);
    h.connect();

    h.phone.link.shutdown();
    h.pump();

    assert!(h.phone.closed);
    assert!(h.band.closed);
    assert!(h.band.events.contains(&LinkEvent::PeerClosed));
    assert!(h
        .phone
        .sent
        .iter()
        .any(|f| f.frame_type == FrameType::SessionConfig));
}
