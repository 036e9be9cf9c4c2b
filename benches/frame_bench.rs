use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};
use wearable_link::core::codec::{FrameCodec, WireFormatKind};
use wearable_link::core::frame::{Channel, Frame, FrameFlags};
use wearable_link::protocol::chunking::split;
use wearable_link::utils::crypto::{SessionCipher, SessionKeys};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [20usize, 244, 4096, 0xFC00];

    for kind in [WireFormatKind::Legacy, WireFormatKind::Crc16] {
        for &size in &payload_sizes {
            let frame = Frame::data(Channel::Bulk, 1, FrameFlags::encrypted(), vec![0x42u8; size]);
            group.throughput(Throughput::Bytes(size as u64));

            group.bench_function(format!("{kind:?}_encode_{size}b"), |b| {
                b.iter_batched(
                    || frame.clone(),
                    |frame| {
                        let mut buf = BytesMut::with_capacity(size + 16);
                        let mut codec = FrameCodec::new(kind, 0xFC00);
                        codec.encode(frame, &mut buf).unwrap();
                    },
                    BatchSize::SmallInput,
                )
            });

            let wire = FrameCodec::new(kind, 0xFC00).encode_frame(&frame).unwrap();
            group.bench_function(format!("{kind:?}_decode_{size}b"), |b| {
                b.iter_batched(
                    || BytesMut::from(&wire[..]),
                    |mut buf| {
                        let mut codec = FrameCodec::new(kind, 0xFC00);
                        assert!(codec.decode(&mut buf).unwrap().is_some());
                    },
                    BatchSize::SmallInput,
                )
            });
        }
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_seal_and_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_and_split");
    let keys = SessionKeys {
        encrypt_key: [1; 16],
        decrypt_key: [2; 16],
        encrypt_nonce_base: [3; 4],
        decrypt_nonce_base: [4; 4],
    };

    for &size in &[244usize, 4096, 65536] {
        let payload = vec![0x17u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("seal_split_{size}b"), |b| {
            b.iter_batched(
                || SessionCipher::new(&keys),
                |mut cipher| {
                    let sealed: Bytes = cipher.seal(&payload).unwrap();
                    split(&sealed, 242)
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_seal_and_split);
criterion_main!(benches);
