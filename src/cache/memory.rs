//! Memory tier: volatile keyed store of resolved assets.
//!
//! Lookups are synchronous and never block. The tier is demand-filled by the
//! coordinator with whatever a slower tier resolved, and bounded by a byte
//! budget with least-recently-used eviction. Nothing here is persisted.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::cache::asset::{Asset, CacheKey, Version};

/// Outcome of a memory lookup.
#[derive(Debug)]
pub enum MemoryLookup {
    /// Fresh entry found.
    Hit(Asset),
    /// Entry existed but was older than requested; it has been dropped.
    Stale { stored: Version },
    /// No entry.
    Miss,
}

pub struct MemoryTier {
    entries: HashMap<CacheKey, Asset>,

    /// Recency order, most-recently-used at the front.
    order: VecDeque<CacheKey>,

    /// Byte budget (0 disables the tier).
    budget: u64,

    /// Bytes currently held.
    used: u64,
}

impl MemoryTier {
    pub fn new(budget: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            budget,
            used: 0,
        }
    }

    /// Look up `key` for a request of at least `version`.
    pub fn load(&mut self, key: &str, version: Version) -> MemoryLookup {
        let stored = match self.entries.get(key) {
            Some(asset) if asset.is_fresh_for(version) => {
                let asset = asset.clone();
                self.touch(key);
                return MemoryLookup::Hit(asset);
            }
            Some(asset) => asset.version,
            None => return MemoryLookup::Miss,
        };

        self.remove(key);
        debug!(key, stored, requested = version, "Dropped stale memory entry");
        MemoryLookup::Stale { stored }
    }

    /// Insert or replace an asset, then evict from the tail until within budget.
    ///
    /// Returns the number of entries evicted. An asset larger than the whole
    /// budget is not stored.
    pub fn insert(&mut self, asset: Asset) -> usize {
        if self.budget == 0 || asset.size() > self.budget {
            self.remove(&asset.key);
            return 0;
        }

        self.remove(&asset.key);
        self.used += asset.size();
        self.order.push_front(asset.key.clone());
        self.entries.insert(asset.key.clone(), asset);

        let mut evicted = 0;
        while self.used > self.budget {
            let Some(victim) = self.order.pop_back() else {
                break;
            };
            if let Some(old) = self.entries.remove(&victim) {
                self.used = self.used.saturating_sub(old.size());
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop the entry for `key`, if any.
    pub fn remove(&mut self, key: &str) -> Option<Asset> {
        let asset = self.entries.remove(key)?;
        self.used = self.used.saturating_sub(asset.size());
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(asset)
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_front(k);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }
}
