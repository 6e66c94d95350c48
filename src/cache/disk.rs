//! Disk tier: capacity-bounded LRU index over backing files.
//!
//! This module owns only metadata. Every operation that would touch the file
//! system hands back the records involved so the coordinator can submit the
//! actual reads, writes and deletes to the worker pool. The in-memory index is
//! the source of truth for hits and misses regardless of whether those file
//! operations have completed yet.
//!
//! Invariants, held after every public call:
//! - a key is in `order` iff it has a record in `records`
//! - `used == sum(record.size)`
//! - `used <= capacity`

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::asset::{is_fresh, CacheKey, Version};

/// Default disk budget: 500 MiB.
pub const DEFAULT_DISK_CAPACITY: u64 = 500 * 1024 * 1024;

/// Persisted metadata for one backing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskChunkRecord {
    pub key: CacheKey,
    pub version: Version,

    /// File name relative to the blob directory. Independent of `key`.
    pub path: String,

    /// Payload size in bytes.
    pub size: u64,
}

/// Whole-index snapshot, the unit of persistence.
///
/// Missing fields deserialize to empty/zero, which [`DiskTier::init`] treats
/// as "keep the current value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIndexSnapshot {
    #[serde(default)]
    pub map: HashMap<CacheKey, DiskChunkRecord>,

    /// Keys, most-recently-used first.
    #[serde(default)]
    pub queue: Vec<CacheKey>,

    #[serde(default)]
    pub capacity: u64,

    #[serde(default, rename = "useSize")]
    pub use_size: u64,
}

/// Outcome of a disk index lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum DiskLookup {
    /// Fresh record; the key has been moved to the LRU head.
    Hit(DiskChunkRecord),
    /// Record was older than requested and has been evicted. Its file still
    /// needs deleting.
    Stale(DiskChunkRecord),
    Miss,
}

/// Result of inserting a record.
#[derive(Debug)]
pub struct SaveOutcome {
    /// The new record, or None when the payload alone exceeds capacity.
    pub record: Option<DiskChunkRecord>,

    /// Records displaced by this save (prior version of the key and LRU
    /// victims). Their files need deleting.
    pub evicted: Vec<DiskChunkRecord>,
}

pub struct DiskTier {
    records: HashMap<CacheKey, DiskChunkRecord>,

    /// Most-recently-used at the front.
    order: VecDeque<CacheKey>,

    capacity: u64,
    used: u64,
}

impl DiskTier {
    pub fn new(capacity: u64) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            used: 0,
        }
    }

    /// Generate a collision-free backing file name.
    pub fn new_blob_name() -> String {
        format!("{}.blob", Uuid::new_v4().simple())
    }

    /// Look up `key` for a request of at least `version`.
    pub fn lookup(&mut self, key: &str, version: Version) -> DiskLookup {
        let fresh = match self.records.get(key) {
            Some(record) => is_fresh(record.version, version),
            None => return DiskLookup::Miss,
        };

        if fresh {
            self.touch(key);
            match self.records.get(key) {
                Some(record) => DiskLookup::Hit(record.clone()),
                None => DiskLookup::Miss,
            }
        } else {
            match self.remove(key) {
                Some(record) => {
                    debug!(key, stored = record.version, requested = version, "Evicted stale disk record");
                    DiskLookup::Stale(record)
                }
                None => DiskLookup::Miss,
            }
        }
    }

    /// Insert a record for `key`, push it to the LRU head and evict from the
    /// tail until usage fits the capacity.
    pub fn save(&mut self, key: &str, version: Version, size: u64) -> SaveOutcome {
        let mut evicted: Vec<DiskChunkRecord> = self.remove(key).into_iter().collect();

        if size > self.capacity {
            warn!(key, size, capacity = self.capacity, "Asset exceeds disk capacity, not stored");
            return SaveOutcome {
                record: None,
                evicted,
            };
        }

        let record = DiskChunkRecord {
            key: key.to_string(),
            version,
            path: Self::new_blob_name(),
            size,
        };
        self.records.insert(record.key.clone(), record.clone());
        self.order.push_front(record.key.clone());
        self.used += size;

        evicted.extend(self.evict_to_capacity());

        debug!(
            key,
            version,
            size,
            used = self.used,
            capacity = self.capacity,
            "Saved disk record"
        );

        SaveOutcome {
            record: Some(record),
            evicted,
        }
    }

    /// Update the capacity and immediately evict down to it.
    pub fn set_capacity(&mut self, capacity: u64) -> Vec<DiskChunkRecord> {
        self.capacity = capacity;
        let evicted = self.evict_to_capacity();
        info!(
            capacity,
            used = self.used,
            evicted = evicted.len(),
            "Disk capacity updated"
        );
        evicted
    }

    /// Evict from the LRU tail while usage exceeds capacity.
    pub fn evict_to_capacity(&mut self) -> Vec<DiskChunkRecord> {
        let mut evicted = Vec::new();
        while self.used > self.capacity {
            match self.remove_last() {
                Some(record) => evicted.push(record),
                None => break,
            }
        }
        evicted
    }

    /// Remove the least-recently-used record.
    pub fn remove_last(&mut self) -> Option<DiskChunkRecord> {
        while let Some(key) = self.order.pop_back() {
            if let Some(record) = self.records.remove(&key) {
                self.used = self.used.saturating_sub(record.size);
                debug!(key = %record.key, size = record.size, "Evicted LRU disk record");
                return Some(record);
            }
        }
        None
    }

    /// Remove the record for `key`, if any.
    pub fn remove(&mut self, key: &str) -> Option<DiskChunkRecord> {
        let record = self.records.remove(key)?;
        self.used = self.used.saturating_sub(record.size);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(record)
    }

    /// Remove the record for `key` only if it still points at `path`.
    ///
    /// Used after a failed read: a re-save that happened while the read was
    /// in flight must not be undone.
    pub fn remove_if_path(&mut self, key: &str, path: &str) -> Option<DiskChunkRecord> {
        match self.records.get(key) {
            Some(record) if record.path == path => self.remove(key),
            _ => None,
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_front(k);
            }
        }
    }

    /// Export the whole index.
    pub fn snapshot(&self) -> DiskIndexSnapshot {
        DiskIndexSnapshot {
            map: self.records.clone(),
            queue: self.order.iter().cloned().collect(),
            capacity: self.capacity,
            use_size: self.used,
        }
    }

    /// Import a snapshot using merge-with-defaults: only non-empty / non-zero
    /// fields replace the current state.
    ///
    /// Afterwards the index is repaired if the snapshot was inconsistent
    /// (queue and map disagree, or `use_size` is not the record sum), and the
    /// eviction loop runs. Returns records evicted by that loop.
    pub fn init(&mut self, snapshot: DiskIndexSnapshot) -> Vec<DiskChunkRecord> {
        if !snapshot.map.is_empty() {
            self.records = snapshot.map;
        }
        if !snapshot.queue.is_empty() {
            self.order = snapshot.queue.into_iter().collect();
        }
        if snapshot.capacity > 0 {
            self.capacity = snapshot.capacity;
        }
        if snapshot.use_size > 0 {
            self.used = snapshot.use_size;
        }

        self.repair();
        self.evict_to_capacity()
    }

    fn repair(&mut self) {
        let mut seen = HashSet::new();
        let before = self.order.len();
        let records = &self.records;
        self.order
            .retain(|key| records.contains_key(key) && seen.insert(key.clone()));
        let dropped = before - self.order.len();

        let mut missing: Vec<CacheKey> = self
            .records
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        missing.sort();
        let appended = missing.len();
        self.order.extend(missing);

        let sum: u64 = self.records.values().map(|r| r.size).sum();
        if dropped > 0 || appended > 0 || sum != self.used {
            warn!(
                dropped,
                appended,
                recorded = self.used,
                actual = sum,
                "Repaired inconsistent disk index snapshot"
            );
        }
        self.used = sum;
    }

    pub fn get(&self, key: &str) -> Option<&DiskChunkRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// All live backing file names.
    pub fn live_paths(&self) -> HashSet<String> {
        self.records.values().map(|r| r.path.clone()).collect()
    }

    /// Keys from most- to least-recently-used.
    pub fn lru_order(&self) -> impl Iterator<Item = &CacheKey> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Default for DiskTier {
    fn default() -> Self {
        Self::new(DEFAULT_DISK_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(tier: &DiskTier) -> Vec<&str> {
        tier.lru_order().map(|k| k.as_str()).collect()
    }

    fn assert_accounting(tier: &DiskTier) {
        let sum: u64 = tier.snapshot().map.values().map(|r| r.size).sum();
        assert_eq!(tier.used_bytes(), sum);
        assert!(tier.used_bytes() <= tier.capacity());
        assert_eq!(tier.lru_order().count(), tier.len());
    }

    #[test]
    fn test_save_evicts_oldest_over_capacity() {
        let mut tier = DiskTier::new(1000);
        tier.save("a", 1, 600);
        let outcome = tier.save("b", 1, 600);

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].key, "a");
        assert!(!tier.contains("a"));
        assert!(tier.contains("b"));
        assert_eq!(tier.used_bytes(), 600);
        assert_accounting(&tier);
    }

    #[test]
    fn test_lookup_hit_moves_to_head() {
        let mut tier = DiskTier::new(1000);
        tier.save("a", 1, 10);
        tier.save("b", 1, 10);
        tier.save("c", 1, 10);
        assert_eq!(keys(&tier), vec!["c", "b", "a"]);

        assert!(matches!(tier.lookup("a", 1), DiskLookup::Hit(_)));
        assert_eq!(keys(&tier), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_stale_lookup_evicts() {
        let mut tier = DiskTier::new(1000);
        tier.save("a", 1, 100);

        match tier.lookup("a", 2) {
            DiskLookup::Stale(record) => assert_eq!(record.version, 1),
            other => panic!("expected stale, got {other:?}"),
        }
        assert!(!tier.contains("a"));
        assert_eq!(tier.used_bytes(), 0);
        assert_eq!(tier.lookup("a", 1), DiskLookup::Miss);
    }

    #[test]
    fn test_overwrite_replaces_record() {
        let mut tier = DiskTier::new(1000);
        let first = tier.save("a", 1, 100).record.unwrap();
        let outcome = tier.save("a", 2, 300);

        assert_eq!(outcome.evicted, vec![first.clone()]);
        let second = outcome.record.unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.used_bytes(), 300);
        assert_accounting(&tier);
    }

    #[test]
    fn test_oversized_save_is_rejected() {
        let mut tier = DiskTier::new(100);
        tier.save("small", 1, 50);
        let outcome = tier.save("big", 1, 500);

        assert!(outcome.record.is_none());
        assert!(outcome.evicted.is_empty());
        assert!(tier.contains("small"));
        assert_accounting(&tier);
    }

    #[test]
    fn test_set_capacity_evicts_from_tail() {
        let mut tier = DiskTier::new(1000);
        for key in ["a", "b", "c", "d"] {
            tier.save(key, 1, 100);
        }
        let evicted = tier.set_capacity(200);
        let evicted: Vec<_> = evicted.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(evicted, vec!["a", "b"]);
        assert_eq!(tier.used_bytes(), 200);
        assert_accounting(&tier);
    }

    #[test]
    fn test_remove_if_path_ignores_resaved_key() {
        let mut tier = DiskTier::new(1000);
        let old = tier.save("a", 1, 10).record.unwrap();
        tier.save("a", 1, 10);

        assert!(tier.remove_if_path("a", &old.path).is_none());
        assert!(tier.contains("a"));

        let current = tier.get("a").unwrap().path.clone();
        assert!(tier.remove_if_path("a", &current).is_some());
        assert!(tier.is_empty());
    }

    #[test]
    fn test_init_merges_with_defaults() {
        let mut tier = DiskTier::default();
        tier.init(DiskIndexSnapshot::default());
        assert_eq!(tier.capacity(), DEFAULT_DISK_CAPACITY);
        assert!(tier.is_empty());

        let mut tier = DiskTier::default();
        tier.init(DiskIndexSnapshot {
            capacity: 4096,
            ..Default::default()
        });
        assert_eq!(tier.capacity(), 4096);
        assert_eq!(tier.used_bytes(), 0);
    }

    #[test]
    fn test_init_repairs_inconsistent_snapshot() {
        let mut source = DiskTier::new(1000);
        source.save("a", 1, 100);
        source.save("b", 1, 200);

        let mut snapshot = source.snapshot();
        snapshot.queue = vec!["ghost".to_string(), "b".to_string()];
        snapshot.use_size = 5;

        let mut tier = DiskTier::new(1000);
        tier.init(snapshot);
        assert_eq!(keys(&tier), vec!["b", "a"]);
        assert_eq!(tier.used_bytes(), 300);
        assert_accounting(&tier);
    }

    #[test]
    fn test_init_evicts_when_over_capacity() {
        let mut source = DiskTier::new(1000);
        source.save("a", 1, 400);
        source.save("b", 1, 400);

        let mut snapshot = source.snapshot();
        snapshot.capacity = 500;

        let mut tier = DiskTier::default();
        let evicted = tier.init(snapshot);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "a");
        assert_accounting(&tier);
    }

    #[test]
    fn test_snapshot_json_field_names() {
        let mut tier = DiskTier::new(1000);
        tier.save("a", 3, 10);
        let json = serde_json::to_value(tier.snapshot()).unwrap();

        assert!(json.get("map").is_some());
        assert_eq!(json["queue"][0], "a");
        assert_eq!(json["capacity"], 1000);
        assert_eq!(json["useSize"], 10);
        assert_eq!(json["map"]["a"]["version"], 3);
    }
}
