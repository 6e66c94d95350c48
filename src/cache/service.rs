//! Control loop and the public cache handle.
//!
//! [`AssetCache::start`] builds the tiers, loads the persisted index and
//! spawns the control loop: a single task that owns the [`Coordinator`] and
//! processes [`Command`]s one at a time. [`AssetCache`] is a cheap, cloneable
//! handle whose methods send a command and await the reply. There is no
//! global instance; the host constructs one and passes it around.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::cache::asset::{Asset, CacheKey, Version};
use crate::cache::coordinator::{CacheStats, Command, Coordinator, Responder};
use crate::cache::disk::{DiskIndexSnapshot, DiskTier};
use crate::cache::error::CacheError;
use crate::cache::metrics::CacheMetrics;
use crate::cache::remote::{Fetcher, RemoteTier};
use crate::config::Config;
use crate::transfer::blob_store::{read_index, BlobStore};

tokio::task_local! {
    /// Set for the lifetime of the control loop task.
    static CONTROL_CONTEXT: ();
}

/// Fail fast when a public operation is issued from inside the control loop,
/// where awaiting the reply would wait on itself.
fn ensure_off_control_context(op: &'static str) -> Result<(), CacheError> {
    if CONTROL_CONTEXT.try_with(|_| ()).is_ok() {
        return Err(CacheError::Reentrant(op));
    }
    Ok(())
}

/// Handle to a running tiered cache.
#[derive(Clone)]
pub struct AssetCache {
    commands: mpsc::Sender<Command>,
    metrics: CacheMetrics,
}

impl AssetCache {
    /// Build the tiers and spawn the control loop.
    ///
    /// A missing, empty or unparseable index file is a cold start. Records
    /// evicted while applying the persisted index (capacity shrank, for
    /// example) have their files removed before the loop starts.
    pub async fn start(
        config: Arc<Config>,
        transport: Option<Arc<dyn Fetcher>>,
    ) -> Result<Self, CacheError> {
        let blobs = BlobStore::new(config.tiers.blob_dir.clone()).await?;
        let disk = load_disk_tier(&config, &blobs).await?;

        if config.tiers.sweep_orphans_on_start {
            blobs.sweep_orphans(&disk.live_paths()).await?;
        }

        let metrics = CacheMetrics::new()?;
        let (tx, rx) = mpsc::channel(config.workers.command_queue.max(1));

        let on_disk = blobs.disk_usage().await?;

        info!(
            disk_records = disk.len(),
            blob_bytes = on_disk,
            io_workers = config.workers.max_concurrent_io,
            disk_used = disk.used_bytes(),
            disk_capacity = disk.capacity(),
            memory_budget = config.tiers.memory_budget,
            blob_dir = %config.tiers.blob_dir.display(),
            "Asset cache starting"
        );

        let coordinator = Coordinator::new(
            &config,
            disk,
            RemoteTier::new(transport),
            blobs,
            metrics.clone(),
            tx.downgrade(),
        );

        tokio::spawn(CONTROL_CONTEXT.scope((), run_control_loop(coordinator, rx)));

        Ok(Self {
            commands: tx,
            metrics,
        })
    }

    async fn request<T>(
        &self,
        op: &'static str,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CacheError> {
        ensure_off_control_context(op)?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CacheError::Closed)?;
        rx.await.map_err(|_| CacheError::Closed)
    }

    /// Resolve `key` at `version` or newer through Memory → Disk → Remote.
    ///
    /// Concurrent calls for the same key share one traversal. Fails only when
    /// the remote tier fails terminally or the cache is shut down.
    pub async fn resolve(
        &self,
        key: impl Into<CacheKey>,
        version: Version,
    ) -> Result<Asset, CacheError> {
        let key = key.into();
        self.request("resolve", |tx| Command::Resolve {
            key,
            version,
            reply: Responder::Caller(tx),
        })
        .await?
    }

    /// Register the fallback fetch strategy, replacing any previous one.
    ///
    /// Returns whether a previous strategy was replaced.
    pub async fn register_fallback(&self, fetcher: Arc<dyn Fetcher>) -> Result<bool, CacheError> {
        self.request("register_fallback", |ack| Command::RegisterFallback { fetcher, ack })
            .await
    }

    /// Queue resolutions for every `(key, version)` in order, discarding results.
    ///
    /// Returns once the batch is queued, not when it completes.
    pub async fn prewarm<I>(&self, items: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (CacheKey, Version)>,
    {
        ensure_off_control_context("prewarm")?;
        let items: Vec<_> = items.into_iter().collect();
        self.commands
            .send(Command::Prewarm { items })
            .await
            .map_err(|_| CacheError::Closed)
    }

    /// Change the disk budget and evict down to it. Returns the eviction count.
    pub async fn set_disk_capacity(&self, bytes: u64) -> Result<usize, CacheError> {
        self.request("set_disk_capacity", |ack| Command::SetCapacity { bytes, ack })
            .await
    }

    /// Snapshot the disk index and write it out off the control loop.
    ///
    /// Completes when the write finishes. Callers that do not need the
    /// outcome can spawn this and move on.
    pub async fn persist_index(&self) -> Result<(), CacheError> {
        self.request("persist_index", |ack| Command::PersistIndex { ack })
            .await?
    }

    /// Current disk index state.
    pub async fn disk_snapshot(&self) -> Result<DiskIndexSnapshot, CacheError> {
        self.request("disk_snapshot", |reply| Command::Snapshot { reply })
            .await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.request("stats", |reply| Command::Stats { reply }).await
    }

    /// Counters in the prometheus text format.
    pub fn metrics_text(&self) -> String {
        self.metrics.gather_text()
    }

    /// Persist the index and stop the control loop. Later calls on any clone
    /// of this handle fail with [`CacheError::Closed`].
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.request("shutdown", |ack| Command::Shutdown { ack })
            .await?
    }
}

async fn run_control_loop(mut coordinator: Coordinator, mut commands: mpsc::Receiver<Command>) {
    info!("Control loop started");
    while let Some(command) = commands.recv().await {
        if let ControlFlow::Break(ack) = coordinator.handle(command) {
            let result = coordinator.persist_index_now().await;
            if let Err(e) = &result {
                warn!(error = %e, "Failed to persist disk index on shutdown");
            }
            let _ = ack.send(result);
            break;
        }
    }
    info!("Control loop stopped");
}

/// Build the disk tier from config and the persisted index.
async fn load_disk_tier(config: &Config, blobs: &BlobStore) -> Result<DiskTier, CacheError> {
    let mut disk = DiskTier::new(config.tiers.disk_budget);
    if let Some(snapshot) = read_index(&config.tiers.index_path).await? {
        for record in disk.init(snapshot) {
            if let Err(e) = blobs.delete_blob(&record.path).await {
                warn!(key = %record.key, path = %record.path, error = %e, "Failed to delete blob");
            }
        }
    }
    Ok(disk)
}

/// Delete backing files no persisted record refers to, without starting a cache.
///
/// Must not run concurrently with a live cache on the same directories.
pub async fn sweep_orphans(config: &Config) -> Result<usize, CacheError> {
    let blobs = BlobStore::new(config.tiers.blob_dir.clone()).await?;
    let disk = load_disk_tier(config, &blobs).await?;
    Ok(blobs.sweep_orphans(&disk.live_paths()).await?)
}

/// Read a persisted index without starting a cache.
pub async fn read_persisted_index(path: &Path) -> Result<Option<DiskIndexSnapshot>, CacheError> {
    Ok(read_index(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reentrant_call_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let cache = AssetCache::start(Arc::new(Config::in_dir(tmp.path())), None)
            .await
            .unwrap();

        let result = CONTROL_CONTEXT
            .scope((), async { cache.resolve("k", 1).await })
            .await;
        assert!(matches!(result, Err(CacheError::Reentrant("resolve"))));

        // Outside the control context the same call reaches the tiers.
        let result = cache.resolve("k", 1).await;
        assert!(matches!(result, Err(CacheError::NoFetcher { .. })));
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_closed() {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(Config::in_dir(tmp.path()));
        let cache = AssetCache::start(config.clone(), None).await.unwrap();

        cache.shutdown().await.unwrap();
        assert!(config.tiers.index_path.exists());
        assert!(matches!(cache.stats().await, Err(CacheError::Closed)));
    }
}
