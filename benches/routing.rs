//! Key routing benchmarks
//!
//! The fingerprint sits on every request path, so its throughput bounds the
//! router. Measured across the length classes the mixer special-cases.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lodestore::routing::{hash_key, slice_for_key};

fn bench_hash_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_key");

    let keys: Vec<(&str, Vec<u8>)> = vec![
        ("4_bytes", b"user".to_vec()),
        ("15_bytes", b"user:profile:42".to_vec()),
        ("64_bytes", vec![0xA5; 64]),
        ("1_kib", vec![0x5A; 1024]),
    ];

    for (name, key) in &keys {
        group.bench_with_input(BenchmarkId::new("hash", name), key, |b, key| {
            b.iter(|| hash_key(black_box(key)));
        });
    }

    group.finish();
}

fn bench_slice_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_for_key");

    for n_slices in [1usize, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("route", n_slices),
            &n_slices,
            |b, &n_slices| {
                let mut i: u64 = 0;
                b.iter(|| {
                    i = i.wrapping_add(1);
                    let key = i.to_le_bytes();
                    slice_for_key(black_box(&key), n_slices)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_hash_key, bench_slice_routing);
criterion_main!(benches);
