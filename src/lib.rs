//! asset-cache-tier: tiered cache for keyed, versioned binary assets.
//!
//! Resolves an asset by checking progressively slower tiers:
//!   Memory (hot) → Local disk, LRU-bounded (warm) → Remote fetch (cold)
//!
//! The first fresh hit wins; a remote result is written back to disk and
//! memory. Concurrent requests for the same key are coalesced into a single
//! traversal. The disk index survives restarts through a JSON snapshot.

pub mod cache;
pub mod config;
pub mod transfer;

pub use cache::{Asset, AssetCache, CacheError, CacheKey, CacheStats, Fetcher, HttpFetcher, Tier, Version};
pub use config::Config;
