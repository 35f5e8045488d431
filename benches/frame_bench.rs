#![allow(clippy::unwrap_used)]

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use framelink::core::codec::FrameCodec;
use framelink::core::frame::{decode, encode, Frame};
use framelink::core::serialization::{Codec, SerializationFormat};
use tokio_util::codec::{Decoder, Encoder};

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");

    for &size in &[0usize, 64, 1024, 65536] {
        let body = vec![0xABu8; size];
        let wire = encode(1, 2, &body).unwrap();
        group.throughput(Throughput::Bytes((size + 16) as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter(|| encode(black_box(1), black_box(2), black_box(&body)).unwrap())
        });
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter(|| decode(black_box(&wire), usize::MAX).unwrap())
        });
        group.bench_function(format!("codec_roundtrip_{size}b"), |b| {
            let mut codec = FrameCodec::default();
            let mut buf = BytesMut::with_capacity(size + 16);
            let frame = Frame::new(1, 2, body.clone());
            b.iter(|| {
                codec.encode(frame.clone(), &mut buf).unwrap();
                codec.decode(&mut buf).unwrap().unwrap()
            })
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");
    let value: (u64, String, Vec<u32>) = (42, "payload".repeat(8), (0..64).collect());

    for format in [
        SerializationFormat::Json,
        SerializationFormat::Bincode,
        SerializationFormat::MessagePack,
    ] {
        let bytes = format.marshal(&value).unwrap();
        group.bench_function(format!("{}_marshal", format.name()), |b| {
            b.iter(|| format.marshal(black_box(&value)).unwrap())
        });
        group.bench_function(format!("{}_unmarshal", format.name()), |b| {
            b.iter(|| {
                let v: (u64, String, Vec<u32>) = format.unmarshal(black_box(&bytes)).unwrap();
                v
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame, bench_serialization);
criterion_main!(benches);
