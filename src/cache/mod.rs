//! Tiered asset cache.
//!
//! This module contains the cache tiers and the machinery that drives them:
//! - [`asset`]: Asset, key/version types, Tier definitions
//! - [`memory`]: Volatile LRU tier
//! - [`disk`]: Capacity-bounded LRU index over backing files
//! - [`remote`]: Pluggable fetch strategies
//! - [`coordinator`]: Request coalescing and the tier chain
//! - [`service`]: Control loop and the public [`AssetCache`] handle
//! - [`metrics`]: Per-cache counters

pub mod asset;
pub mod coordinator;
pub mod disk;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod remote;
pub mod service;

pub use asset::{Asset, CacheKey, Tier, Version};
pub use coordinator::CacheStats;
pub use error::CacheError;
pub use remote::{Fetcher, HttpFetcher};
pub use service::AssetCache;
