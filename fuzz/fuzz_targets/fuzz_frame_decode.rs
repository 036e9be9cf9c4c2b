#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;
use wearable_link::core::codec::{FrameCodec, WireFormatKind};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must never panic, loop forever or return an error
    for kind in [WireFormatKind::Legacy, WireFormatKind::Crc16] {
        let mut codec = FrameCodec::new(kind, 1024);
        let mut buf = BytesMut::from(data);
        while let Ok(Some(frame)) = codec.decode(&mut buf) {
            // Whatever decodes must encode again
            let _ = codec.encode_frame(&frame);
        }
    }
});
