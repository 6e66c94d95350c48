//! Integration tests for disk tier eviction and accounting.

use asset_cache_tier::cache::disk::{DiskLookup, DiskTier};

fn evicted_keys(records: &[asset_cache_tier::cache::disk::DiskChunkRecord]) -> Vec<String> {
    records.iter().map(|r| r.key.clone()).collect()
}

fn assert_within_budget(tier: &DiskTier) {
    let sum: u64 = tier.snapshot().map.values().map(|r| r.size).sum();
    assert_eq!(tier.used_bytes(), sum);
    assert!(tier.used_bytes() <= tier.capacity());
}

#[test]
fn test_capacity_scenario() {
    let mut tier = DiskTier::new(1000);
    tier.save("a", 1, 600);
    let outcome = tier.save("b", 1, 600);

    assert_eq!(evicted_keys(&outcome.evicted), vec!["a"]);
    assert_eq!(tier.len(), 1);
    assert!(tier.contains("b"));
    assert_eq!(tier.used_bytes(), 600);
}

#[test]
fn test_hit_protects_from_eviction() {
    let mut tier = DiskTier::new(300);
    tier.save("A", 1, 100);
    tier.save("B", 1, 100);
    tier.save("C", 1, 100);

    // Hit A again: B is now least recently used.
    assert!(matches!(tier.lookup("A", 1), DiskLookup::Hit(_)));

    let first = tier.set_capacity(200);
    assert_eq!(evicted_keys(&first), vec!["B"]);

    let second = tier.set_capacity(100);
    assert_eq!(evicted_keys(&second), vec!["C"]);
    assert!(tier.contains("A"));
}

#[test]
fn test_usage_never_exceeds_capacity() {
    let mut tier = DiskTier::new(1000);
    let sizes = [120u64, 450, 80, 999, 1, 300, 700, 64, 512, 256, 1000, 33];

    for (i, size) in sizes.iter().enumerate() {
        let key = format!("k{}", i % 5);
        tier.save(&key, i as u64, *size);
        assert_within_budget(&tier);
    }

    // Re-saving under existing keys never leaves duplicate queue entries.
    assert_eq!(tier.lru_order().count(), tier.len());
}

#[test]
fn test_shrink_to_zero_empties_tier() {
    let mut tier = DiskTier::new(1000);
    for key in ["a", "b", "c"] {
        tier.save(key, 1, 10);
    }
    let evicted = tier.set_capacity(0);
    assert_eq!(evicted.len(), 3);
    assert!(tier.is_empty());
    assert_eq!(tier.used_bytes(), 0);
}
