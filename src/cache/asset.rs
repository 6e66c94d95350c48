//! Asset types and tier definitions.
//!
//! An asset is an opaque blob of bytes identified by a string key and a
//! monotonically increasing version. Assets are the unit of movement
//! between tiers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical identity of an asset (not its content hash).
pub type CacheKey = String;

/// Asset version. Higher is newer.
pub type Version = u64;

/// Whether an entry stored at `stored` satisfies a request for `requested`.
///
/// An entry is fresh iff `stored >= requested`; anything older is stale and
/// must be evicted before a newer result is cached under the same key.
pub fn is_fresh(stored: Version, requested: Version) -> bool {
    stored >= requested
}

/// Identifies which tier served (or failed to serve) a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 0: process memory (hot).
    Memory,
    /// Tier 1: capacity-bounded local disk (warm).
    Disk,
    /// Tier 2: remote fetch strategy (cold).
    Remote,
}

impl Tier {
    /// Label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Disk => "disk",
            Tier::Remote => "remote",
        }
    }
}

/// A resolved asset.
///
/// `data` is reference counted, so cloning an asset to back-fill the memory
/// tier or hand it to a caller does not copy the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Key the asset was resolved under.
    pub key: CacheKey,

    /// Version the asset is stored at.
    pub version: Version,

    /// Raw asset bytes.
    pub data: Bytes,
}

impl Asset {
    pub fn new(key: impl Into<CacheKey>, version: Version, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            version,
            data: data.into(),
        }
    }

    /// Size of the payload in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether this asset satisfies a request for `requested`.
    pub fn is_fresh_for(&self, requested: Version) -> bool {
        is_fresh(self.version, requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_labels() {
        assert_eq!(Tier::Memory.as_str(), "memory");
        assert_eq!(Tier::Disk.as_str(), "disk");
        assert_eq!(Tier::Remote.as_str(), "remote");
    }

    #[test]
    fn test_freshness() {
        assert!(is_fresh(2, 2));
        assert!(is_fresh(3, 2));
        assert!(!is_fresh(1, 2));

        let asset = Asset::new("a", 5, vec![0u8; 16]);
        assert!(asset.is_fresh_for(0));
        assert!(!asset.is_fresh_for(6));
        assert_eq!(asset.size(), 16);
    }
}
