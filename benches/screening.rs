//! Screening benchmarks over synthetic fingerprints
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use molsieve::index::{FingerprintBlock, IndexConfig, IndexContext};
use molsieve::storage::{MemoryBlobStore, SharedCacheConfig, StorageConfig};
use molsieve::utils::popcount;
use std::sync::Arc;
use tempfile::TempDir;

const FP_BYTES: usize = 128;

/// Sparse fingerprints, roughly one bit in eight set
fn synthetic_fingerprints(rows: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    (0..rows * FP_BYTES)
        .map(|_| {
            let (a, b, c) = (next() as u8, next() as u8, next() as u8);
            a & b & c
        })
        .collect()
}

/// A loaded context with `rows` records
fn loaded_context(rows: usize) -> (TempDir, IndexContext) {
    let shm = TempDir::new().expect("Failed to create temp dir");
    let config = IndexConfig {
        fp_bytes: FP_BYTES,
        storage: StorageConfig {
            shared: SharedCacheConfig {
                shm_dir: Some(shm.path().to_path_buf()),
                ..SharedCacheConfig::default()
            },
            ..StorageConfig::default()
        },
        ..IndexConfig::default()
    };
    let blob = Arc::new(MemoryBlobStore::new("mem://bench"));
    let mut ctx = IndexContext::new(blob, 1, config).expect("Failed to open context");
    ctx.create().expect("Failed to create tables");
    ctx.validate_for_insert().expect("Failed to prepare writer");

    let raw = synthetic_fingerprints(rows);
    for (i, fp) in raw.chunks_exact(FP_BYTES).enumerate() {
        ctx.insert(fp, format!("record {}", i).as_bytes())
            .expect("Failed to insert");
    }
    ctx.flush().expect("Failed to flush");
    ctx.finish();
    ctx.validate().expect("Failed to load");
    (shm, ctx)
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    group.sample_size(20);

    for rows in [1024, 16384, 65536] {
        let raw = synthetic_fingerprints(rows);
        let counters: Vec<u16> = raw
            .chunks_exact(FP_BYTES)
            .map(|fp| popcount(fp) as u16)
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| FingerprintBlock::optimize(FP_BYTES, black_box(&raw), black_box(&counters)))
        });
    }
    group.finish();
}

fn bench_screen(c: &mut Criterion) {
    let (_shm, ctx) = loaded_context(100_000);
    let fingerprints = ctx.fingerprints();

    let mut dense = vec![0u8; FP_BYTES];
    dense[..4].copy_from_slice(&[0x11, 0x22, 0x44, 0x88]);
    let mut single = vec![0u8; FP_BYTES];
    single[7] = 0x01;

    let mut group = c.benchmark_group("screen");

    group.bench_function("single_bit", |b| {
        b.iter(|| fingerprints.screen(black_box(&single)))
    });

    group.bench_function("eight_bits", |b| {
        b.iter(|| fingerprints.screen(black_box(&dense)))
    });

    group.bench_function("count_ones", |b| {
        b.iter(|| {
            let mut screening = fingerprints.screen_init(black_box(&dense)).expect("init");
            fingerprints.count_ones(&mut screening).expect("count");
            screening
        })
    });

    group.finish();
}

criterion_group!(benches, bench_optimize, bench_screen);
criterion_main!(benches);
