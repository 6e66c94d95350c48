//! Error taxonomy for the asset cache.
//!
//! Stale entries and tier misses are not errors: they are lookup outcomes
//! that make the coordinator fall through to the next tier. Write and delete
//! failures on backing files are logged where they happen and never reach a
//! caller. What remains is what a caller can actually observe.

use thiserror::Error;

use crate::transfer::blob_store::BlobStoreError;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The remote tier could not produce the asset. Terminal for the resolution.
    #[error("fetch failed for {key}@{version}: {reason}")]
    Fetch {
        key: String,
        version: u64,
        reason: String,
    },

    /// No transport and no fallback strategy are registered.
    #[error("no fetch strategy registered for {key}")]
    NoFetcher { key: String },

    /// A public operation was issued from inside the control loop.
    #[error("cache operation `{0}` invoked from the control context")]
    Reentrant(&'static str),

    /// The control loop has stopped.
    #[error("cache control loop is not running")]
    Closed,

    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CacheError {
    /// Whether this error came from the remote tier rather than the cache itself.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, CacheError::Fetch { .. } | CacheError::NoFetcher { .. })
    }
}
