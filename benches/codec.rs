//! Benchmarks for wire framing
//!
//! Run with: cargo bench --bench codec
//!
//! Covers the hot path of every receive: peeling consecutive frames off one buffer.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lockstep_mesh::__internal::{decode_frame, encode_frame, Decoded};
use lockstep_mesh::MessageKind;
use std::hint::black_box;

/// A `PeerGameData` payload holding one state entry and `deltas` delta entries.
fn batch_payload(deltas: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + 8 * (deltas + 1));
    payload.extend_from_slice(&((deltas + 1) as i32).to_le_bytes());
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&1234i32.to_le_bytes());
    for i in 0..deltas {
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&(i as i32).to_le_bytes());
    }
    payload
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for deltas in [1usize, 16, 256] {
        let payload = batch_payload(deltas);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(deltas), &payload, |b, payload| {
            b.iter(|| black_box(encode_frame(MessageKind::PeerGameData, payload)));
        });
    }
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_stream");
    for frames in [1usize, 32, 512] {
        let mut stream = Vec::new();
        for _ in 0..frames {
            if let Ok(frame) = encode_frame(MessageKind::PeerGameData, &batch_payload(4)) {
                stream.extend(frame);
            }
        }
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(frames), &stream, |b, stream| {
            b.iter(|| {
                let mut offset = 0;
                while let Decoded::Frame { consumed, .. } = decode_frame(&stream[offset..], 64 * 1024) {
                    offset += consumed;
                }
                black_box(offset)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_stream);
criterion_main!(benches);
