//! Integration tests for the frame codec
//!
//! Both wire formats must round-trip every frame shape the link produces,
//! tolerate partial reads and skip garbage without losing the next frame.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use wearable_link::config::DEFAULT_MTU;
use wearable_link::core::codec::{FrameCodec, WireFormatKind};
use wearable_link::core::frame::{Channel, Frame, FrameFlags, FrameType};
use wearable_link::error::ProtocolError;

const FORMATS: [WireFormatKind; 2] = [WireFormatKind::Legacy, WireFormatKind::Crc16];

fn payload(len: usize) -> Bytes {
    // avoid both preamble lead bytes so resync tests stay deterministic
    Bytes::from((0..len).map(|i| (i % 0x90) as u8).collect::<Vec<_>>())
}

fn codec(kind: WireFormatKind) -> FrameCodec {
    match kind {
        WireFormatKind::Legacy => FrameCodec::legacy(),
        WireFormatKind::Crc16 => FrameCodec::crc16(),
    }
}

fn encode(kind: WireFormatKind, frame: &Frame) -> BytesMut {
    codec(kind).encode_frame(frame).expect("frame encodes")
}

#[test]
fn test_data_frames_roundtrip_around_mtu() {
    for kind in FORMATS {
        for len in [0, 1, DEFAULT_MTU - 1, DEFAULT_MTU, DEFAULT_MTU + 1] {
            let frame = Frame::data(
                Channel::Command,
                (len % 256) as u8,
                FrameFlags {
                    encrypted: len % 2 == 0,
                    needs_response: len % 3 == 0,
                },
                payload(len),
            );

            let mut buf = encode(kind, &frame);
            let decoded = codec(kind).decode(&mut buf).unwrap();
            assert_eq!(decoded.as_ref(), Some(&frame), "{kind:?} len {len}");
            assert!(buf.is_empty());
        }
    }
}

#[test]
fn test_every_channel_roundtrips() {
    for kind in FORMATS {
        for channel in Channel::ALL {
            let frame = Frame::chunk(channel, 7, payload(12));
            let mut buf = encode(kind, &frame);
            let decoded = codec(kind).decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.channel, channel, "{kind:?}");
            assert_eq!(decoded.frame_type, FrameType::Chunk);
        }
    }
}

#[test]
fn test_control_frames_roundtrip() {
    for kind in FORMATS {
        for frame in [Frame::ack(42), Frame::session_config(3, vec![1, 1, 3, 1, 0, 0])] {
            let mut buf = encode(kind, &frame);
            let decoded = codec(kind).decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame, "{kind:?}");
        }
    }
}

#[test]
fn test_crc16_control_frames_reject_channels() {
    let frame = Frame::new(
        FrameType::Ack,
        Channel::Command,
        0,
        FrameFlags::plain(),
        Bytes::new(),
    );
    let err = FrameCodec::crc16().encode_frame(&frame).unwrap_err();
    assert!(matches!(err, ProtocolError::Encode(_)));
}

#[test]
fn test_oversized_payload_rejected_on_encode() {
    for kind in FORMATS {
        let mut small = FrameCodec::new(kind, 64);
        let frame = Frame::data(Channel::Bulk, 0, FrameFlags::plain(), payload(65));
        let mut dst = BytesMut::new();
        let err = small.encode(frame, &mut dst).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedFrame(65)), "{kind:?}");
    }
}

#[test]
fn test_partial_reads_wait_for_whole_frame() {
    for kind in FORMATS {
        let frame = Frame::data(Channel::Activity, 9, FrameFlags::encrypted(), payload(40));
        let wire = encode(kind, &frame);
        let mut codec = codec(kind);
        let mut buf = BytesMut::new();

        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none(), "{kind:?} decoded early at byte {i}");
            } else {
                assert_eq!(decoded, Some(frame.clone()));
            }
        }
        assert_eq!(codec.resyncs(), 0);
    }
}

#[test]
fn test_garbage_before_frame_is_skipped() {
    for kind in FORMATS {
        let frame = Frame::data(Channel::Command, 1, FrameFlags::plain(), payload(16));
        let mut buf = BytesMut::from(&[0x00, 0x13, 0x37, 0x42, 0x99][..]);
        buf.extend_from_slice(&encode(kind, &frame));

        let mut codec = codec(kind);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(frame), "{kind:?}");
        assert!(codec.resyncs() >= 1);
        assert_eq!(codec.discarded_bytes(), 5);
    }
}

#[test]
fn test_corrupt_frame_does_not_hide_next_frame() {
    for kind in FORMATS {
        let first = Frame::data(Channel::Command, 1, FrameFlags::plain(), payload(20));
        let second = Frame::data(Channel::Command, 2, FrameFlags::plain(), payload(8));

        let mut corrupt = encode(kind, &first);
        // break the checksum (crc16) or the trailer (legacy)
        let last = corrupt.len() - 1;
        match kind {
            WireFormatKind::Crc16 => corrupt[10] ^= 0x01,
            WireFormatKind::Legacy => corrupt[last] = 0x00,
        }

        let mut buf = corrupt;
        buf.extend_from_slice(&encode(kind, &second));

        let mut codec = codec(kind);
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(second), "{kind:?}");
        assert!(buf.is_empty());
    }
}

#[test]
fn test_back_to_back_frames_decode_in_order() {
    for kind in FORMATS {
        let frames: Vec<Frame> = (0..5u8)
            .map(|i| Frame::data(Channel::Bulk, i, FrameFlags::plain(), payload(i as usize * 10)))
            .collect();

        let mut encoder = codec(kind);
        let mut buf = BytesMut::new();
        for frame in &frames {
            encoder.encode(frame.clone(), &mut buf).unwrap();
        }

        let mut decoder = codec(kind);
        let mut decoded = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames, "{kind:?}");
    }
}

#[test]
fn test_declared_length_beyond_limit_resyncs() {
    let mut codec = FrameCodec::new(WireFormatKind::Crc16, 64);
    // preamble, Data type, seq 0, length 0x1000, bogus crc
    let mut buf = BytesMut::from(&[0xA5, 0xA5, 0x03, 0x00, 0x00, 0x10, 0x00, 0x00][..]);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    assert!(codec.resyncs() >= 1);
    assert!(buf.len() < 8, "oversized header must not be buffered");
}
