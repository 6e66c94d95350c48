//! Benchmarks for the cache tiers.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use asset_cache_tier::cache::disk::DiskTier;
use asset_cache_tier::cache::memory::MemoryTier;
use asset_cache_tier::Asset;

fn bench_disk_save_with_eviction(c: &mut Criterion) {
    // Room for 1,000 records of 1 KiB; every save past that evicts.
    let mut tier = DiskTier::new(1_000 * 1024);
    let keys: Vec<String> = (0..10_000).map(|i| format!("asset-{i}")).collect();

    c.bench_function("disk_save_10k_evicting", |b| {
        b.iter(|| {
            for key in &keys {
                let outcome = tier.save(black_box(key), 1, 1024);
                black_box(outcome);
            }
        })
    });
}

fn bench_disk_lookup_hit(c: &mut Criterion) {
    let mut tier = DiskTier::new(u64::MAX);
    let keys: Vec<String> = (0..1_000).map(|i| format!("asset-{i}")).collect();
    for key in &keys {
        tier.save(key, 1, 128);
    }

    c.bench_function("disk_lookup_1k_hits", |b| {
        b.iter(|| {
            for key in keys.iter().step_by(7) {
                black_box(tier.lookup(black_box(key), 1));
            }
        })
    });
}

fn bench_memory_load(c: &mut Criterion) {
    let mut tier = MemoryTier::new(u64::MAX);
    let keys: Vec<String> = (0..1_000).map(|i| format!("asset-{i}")).collect();
    for key in &keys {
        tier.insert(Asset::new(key.clone(), 1, vec![0u8; 256]));
    }

    c.bench_function("memory_load_1k_hits", |b| {
        b.iter(|| {
            for key in keys.iter().step_by(7) {
                black_box(tier.load(black_box(key), 1));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_disk_save_with_eviction,
    bench_disk_lookup_hit,
    bench_memory_load,
);
criterion_main!(benches);
