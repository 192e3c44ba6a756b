//! Benchmarks for SyncLayer operations
//!
//! Run with: cargo bench --bench sync_layer

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_mesh::__internal::SyncLayer;
use lockstep_mesh::SyncConfig;
use std::hint::black_box;
use web_time::Instant;

/// Builds `participants` engines that all know each other and have started with the same seed.
fn mesh(participants: usize) -> Vec<SyncLayer> {
    let names: Vec<String> = (0..participants).map(|i| format!("p{i}")).collect();
    names
        .iter()
        .map(|name| {
            let mut layer = SyncLayer::new(name.clone(), SyncConfig::default());
            layer.start(7, names.iter().cloned());
            layer
        })
        .collect()
}

/// One full lockstep frame: every engine submits, every batch is delivered, every engine advances.
fn run_frame(layers: &mut [SyncLayer], names: &[String], now: Instant) {
    let batches: Vec<_> = layers
        .iter_mut()
        .enumerate()
        .map(|(i, layer)| layer.submit_local(&[i as i32, 1]))
        .collect();
    for (receiver, layer) in layers.iter_mut().enumerate() {
        for (sender, batch) in batches.iter().enumerate() {
            if sender != receiver {
                layer.enqueue(&names[sender], batch.clone());
            }
        }
    }
    for layer in layers.iter_mut() {
        black_box(layer.try_advance(now));
    }
}

fn bench_lockstep_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("lockstep_frame");
    for participants in [2usize, 4, 8] {
        let names: Vec<String> = (0..participants).map(|i| format!("p{i}")).collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(participants),
            &participants,
            |b, &participants| {
                let mut layers = mesh(participants);
                let now = Instant::now();
                b.iter(|| run_frame(&mut layers, &names, now));
            },
        );
    }
    group.finish();
}

fn bench_stalled_advance(c: &mut Criterion) {
    c.bench_function("stalled_advance", |b| {
        let mut layers = mesh(4);
        let now = Instant::now();
        b.iter(|| black_box(layers[0].try_advance(now)));
    });
}

criterion_group!(benches, bench_lockstep_frame, bench_stalled_advance);
criterion_main!(benches);
