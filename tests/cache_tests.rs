//! Integration tests for index persistence and tier lookups.

use asset_cache_tier::cache::disk::{DiskIndexSnapshot, DiskLookup, DiskTier, DEFAULT_DISK_CAPACITY};
use asset_cache_tier::cache::memory::{MemoryLookup, MemoryTier};
use asset_cache_tier::transfer::blob_store::{read_index, write_index};
use asset_cache_tier::Asset;
use tempfile::TempDir;

#[test]
fn test_snapshot_round_trip_restores_identical_state() {
    let mut original = DiskTier::new(10_000);
    original.save("a", 1, 100);
    original.save("b", 2, 200);
    original.save("c", 3, 300);
    original.lookup("a", 1);

    let json = serde_json::to_string(&original.snapshot()).unwrap();
    let snapshot: DiskIndexSnapshot = serde_json::from_str(&json).unwrap();

    let mut restored = DiskTier::default();
    let evicted = restored.init(snapshot);
    assert!(evicted.is_empty());

    assert_eq!(restored.snapshot(), original.snapshot());
    let order: Vec<_> = restored.lru_order().cloned().collect();
    assert_eq!(order, vec!["a", "c", "b"]);
    assert_eq!(restored.capacity(), 10_000);
    assert_eq!(restored.used_bytes(), 600);
}

#[test]
fn test_empty_document_keeps_defaults() {
    let snapshot: DiskIndexSnapshot = serde_json::from_str("{}").unwrap();
    let mut tier = DiskTier::default();
    tier.init(snapshot);

    assert!(tier.is_empty());
    assert_eq!(tier.capacity(), DEFAULT_DISK_CAPACITY);
    assert_eq!(tier.used_bytes(), 0);
}

#[test]
fn test_stale_disk_entry_is_removed_on_lookup() {
    let mut tier = DiskTier::new(1000);
    tier.save("k", 1, 10);

    assert!(matches!(tier.lookup("k", 2), DiskLookup::Stale(_)));
    assert!(!tier.contains("k"));
}

#[test]
fn test_memory_tier_freshness() {
    let mut tier = MemoryTier::new(1024);
    tier.insert(Asset::new("k", 2, vec![1u8; 8]));

    assert!(matches!(tier.load("k", 1), MemoryLookup::Hit(_)));
    assert!(matches!(tier.load("k", 2), MemoryLookup::Hit(_)));
    assert!(matches!(tier.load("k", 3), MemoryLookup::Stale { stored: 2 }));
    assert!(matches!(tier.load("k", 1), MemoryLookup::Miss));
}

#[tokio::test]
async fn test_index_file_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("asset_index.json");

    let mut tier = DiskTier::new(4096);
    tier.save("x", 7, 1000);
    tier.save("y", 8, 2000);

    write_index(&path, &tier.snapshot()).await.unwrap();
    let snapshot = read_index(&path).await.unwrap().expect("index present");

    let mut restored = DiskTier::default();
    restored.init(snapshot);
    assert_eq!(restored.snapshot(), tier.snapshot());
}
