//! Coordinator: request coalescing and the Memory → Disk → Remote chain.
//!
//! The coordinator is the state owned by the control loop. It is the only
//! writer of the memory tier, the disk index and the pending-request map.
//! Background work is submitted to the worker pool and reports back as a
//! [`Command`] on the control loop's channel; no background task touches tier
//! state directly.
//!
//! Per key, at most one tracked traversal of the tier chain is in flight. A
//! request arriving while one is running waits on that key's signal (bounded
//! by the coalescing timeout) off the control loop, then re-enters and checks
//! the tiers again, which normally finds the freshly back-filled memory entry.
//!
//! Every traversal carries a chain id. Only the traversal whose id the
//! pending entry records may end that entry; a duplicate started by a timed
//! out waiter runs untracked and leaves the entry alone when it finishes.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cache::asset::{Asset, CacheKey, Tier, Version};
use crate::cache::disk::{DiskChunkRecord, DiskIndexSnapshot, DiskLookup, DiskTier};
use crate::cache::error::CacheError;
use crate::cache::memory::{MemoryLookup, MemoryTier};
use crate::cache::metrics::CacheMetrics;
use crate::cache::remote::{Fetcher, RemoteTier};
use crate::config::Config;
use crate::transfer::blob_store::{BlobIoCounts, BlobStore, BlobStoreError, IndexWriter};
use crate::transfer::worker_pool::{JobKind, WorkerPool};

/// Identifies one traversal of the tier chain.
pub(crate) type ChainId = u64;

/// Acknowledgement for a shutdown request.
pub(crate) type ShutdownAck = oneshot::Sender<Result<(), CacheError>>;

/// Where a resolution's result goes.
pub(crate) enum Responder {
    /// A caller awaiting the result.
    Caller(oneshot::Sender<Result<Asset, CacheError>>),
    /// Pre-warm: the result only matters for its side effect on the tiers.
    Discard,
}

impl Responder {
    fn deliver(self, key: &str, result: Result<Asset, CacheError>) {
        match self {
            Responder::Caller(tx) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(result);
            }
            Responder::Discard => {
                if let Err(e) = result {
                    debug!(key, error = %e, "Pre-warm resolution failed");
                }
            }
        }
    }
}

/// Messages processed by the control loop.
pub(crate) enum Command {
    Resolve {
        key: CacheKey,
        version: Version,
        reply: Responder,
    },
    /// A coalesced waiter coming back after the signal or its timeout.
    Rejoin {
        key: CacheKey,
        version: Version,
        /// The traversal the waiter was waiting on.
        chain: ChainId,
        timed_out: bool,
        reply: Responder,
    },
    DiskRead {
        key: CacheKey,
        version: Version,
        chain: ChainId,
        record: DiskChunkRecord,
        result: Result<Bytes, BlobStoreError>,
        reply: Responder,
    },
    Fetched {
        key: CacheKey,
        chain: ChainId,
        result: Result<Asset, CacheError>,
        reply: Responder,
    },
    RegisterFallback {
        fetcher: Arc<dyn Fetcher>,
        ack: oneshot::Sender<bool>,
    },
    Prewarm {
        items: Vec<(CacheKey, Version)>,
    },
    SetCapacity {
        bytes: u64,
        ack: oneshot::Sender<usize>,
    },
    PersistIndex {
        ack: oneshot::Sender<Result<(), CacheError>>,
    },
    Snapshot {
        reply: oneshot::Sender<DiskIndexSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    Shutdown {
        ack: ShutdownAck,
    },
}

/// Lifecycle of a key's in-flight resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Fetching,
    EndFetching,
}

/// Coalescing entry for one key.
struct PendingRequest {
    state: FetchState,

    /// The traversal allowed to end this entry.
    chain: ChainId,

    /// Bumped every time a resolution for the key completes.
    signal: watch::Sender<u64>,

    /// Coalesced requests that have not re-entered yet.
    waiters: usize,
}

impl PendingRequest {
    fn new() -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            state: FetchState::EndFetching,
            chain: 0,
            signal,
            waiters: 0,
        }
    }
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_used: u64,
    pub memory_budget: u64,
    pub disk_entries: usize,
    pub disk_used: u64,
    pub disk_capacity: u64,
    /// Keys currently present in the coalescing map.
    pub pending_keys: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub remote_hits: u64,
    pub memory_evictions: u64,
    pub disk_evictions: u64,
    pub coalesced_waits: u64,
    pub fetch_failures: u64,
    pub io_in_flight: usize,
    pub blob_io: BlobIoCounts,
}

pub(crate) struct Coordinator {
    memory: MemoryTier,
    disk: DiskTier,
    remote: RemoteTier,

    pending: HashMap<CacheKey, PendingRequest>,
    last_chain: ChainId,

    blobs: BlobStore,
    pool: WorkerPool,
    metrics: CacheMetrics,

    /// Completions are sent back here. Weak so that dropping every
    /// `AssetCache` handle lets the control loop end.
    commands: mpsc::WeakSender<Command>,

    wait_timeout: Duration,

    index: IndexWriter,
    /// Bumped for every index snapshot taken.
    index_generation: u64,
}

impl Coordinator {
    pub(crate) fn new(
        config: &Config,
        disk: DiskTier,
        remote: RemoteTier,
        blobs: BlobStore,
        metrics: CacheMetrics,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            memory: MemoryTier::new(config.tiers.memory_budget),
            disk,
            remote,
            pending: HashMap::new(),
            last_chain: 0,
            blobs,
            pool: WorkerPool::new(config.workers.max_concurrent_io, metrics.clone()),
            metrics,
            commands,
            wait_timeout: config.coalescing.wait_timeout(),
            index: IndexWriter::new(config.tiers.index_path.clone()),
            index_generation: 0,
        }
    }

    /// Process one command. Never blocks. Breaks with the acknowledgement
    /// when the command asks the control loop to stop.
    pub(crate) fn handle(&mut self, command: Command) -> ControlFlow<ShutdownAck> {
        match command {
            Command::Resolve {
                key,
                version,
                reply,
            } => self.resolve(key, version, reply),
            Command::Rejoin {
                key,
                version,
                chain,
                timed_out,
                reply,
            } => self.rejoin(key, version, chain, timed_out, reply),
            Command::DiskRead {
                key,
                version,
                chain,
                record,
                result,
                reply,
            } => self.on_disk_read(key, version, chain, record, result, reply),
            Command::Fetched {
                key,
                chain,
                result,
                reply,
            } => self.on_fetched(key, chain, result, reply),
            Command::RegisterFallback { fetcher, ack } => {
                let replaced = self.remote.set_fallback(fetcher);
                info!(replaced, "Fallback fetch strategy registered");
                let _ = ack.send(replaced);
            }
            Command::Prewarm { items } => {
                info!(count = items.len(), "Pre-warming cache");
                for (key, version) in items {
                    self.resolve(key, version, Responder::Discard);
                }
            }
            Command::SetCapacity { bytes, ack } => {
                let evicted = self.disk.set_capacity(bytes);
                let count = evicted.len();
                self.metrics.evicted(Tier::Disk, count);
                self.delete_blobs(evicted);
                let _ = ack.send(count);
            }
            Command::PersistIndex { ack } => self.persist_index(ack),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.disk.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { ack } => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    fn next_chain(&mut self) -> ChainId {
        self.last_chain += 1;
        self.last_chain
    }

    fn resolve(&mut self, key: CacheKey, version: Version, reply: Responder) {
        if let Some(entry) = self.pending.get_mut(&key) {
            if entry.state == FetchState::Fetching {
                let Some(tx) = self.commands.upgrade() else {
                    reply.deliver(&key, Err(CacheError::Closed));
                    return;
                };
                let mut signal = entry.signal.subscribe();
                let chain = entry.chain;
                entry.waiters += 1;
                self.metrics.coalesced_wait();
                debug!(key = %key, version, waiters = entry.waiters, "Coalescing onto in-flight resolution");

                let wait = self.wait_timeout;
                tokio::spawn(async move {
                    let timed_out = tokio::time::timeout(wait, signal.changed()).await.is_err();
                    if timed_out {
                        debug!(key = %key, "Coalescing wait timed out, re-checking tiers");
                    }
                    let _ = tx
                        .send(Command::Rejoin {
                            key,
                            version,
                            chain,
                            timed_out,
                            reply,
                        })
                        .await;
                });
                return;
            }
        }

        let chain = self.next_chain();
        let entry = self
            .pending
            .entry(key.clone())
            .or_insert_with(PendingRequest::new);
        entry.state = FetchState::Fetching;
        entry.chain = chain;
        self.begin_chain(key, version, chain, reply);
    }

    /// A waiter re-enters. After a signal, or when the traversal it waited on
    /// has since been replaced, it goes through the normal coalescing check.
    /// After a timeout on a traversal that is still in flight it traverses the
    /// tiers itself, untracked, so a stuck fetch cannot hold waiters forever;
    /// this may duplicate that fetch.
    fn rejoin(
        &mut self,
        key: CacheKey,
        version: Version,
        waited_on: ChainId,
        timed_out: bool,
        reply: Responder,
    ) {
        let still_fetching = match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.waiters = entry.waiters.saturating_sub(1);
                entry.state == FetchState::Fetching && entry.chain == waited_on
            }
            None => false,
        };

        if timed_out && still_fetching {
            let chain = self.next_chain();
            self.begin_chain(key.clone(), version, chain, reply);
        } else {
            self.resolve(key.clone(), version, reply);
        }
        self.reap(&key);
    }

    fn begin_chain(&mut self, key: CacheKey, version: Version, chain: ChainId, reply: Responder) {
        match self.memory.load(&key, version) {
            MemoryLookup::Hit(asset) => {
                self.metrics.hit(Tier::Memory);
                debug!(key = %key, version, "Memory hit");
                self.finish(&key, chain, Ok(asset), reply);
                return;
            }
            MemoryLookup::Stale { .. } => self.metrics.miss(Tier::Memory, "stale"),
            MemoryLookup::Miss => self.metrics.miss(Tier::Memory, "absent"),
        }

        match self.disk.lookup(&key, version) {
            DiskLookup::Hit(record) => self.read_from_disk(key, version, chain, record, reply),
            DiskLookup::Stale(record) => {
                self.metrics.miss(Tier::Disk, "stale");
                self.metrics.evicted(Tier::Disk, 1);
                self.delete_blobs(vec![record]);
                self.fetch_remote(key, version, chain, reply);
            }
            DiskLookup::Miss => {
                self.metrics.miss(Tier::Disk, "absent");
                self.fetch_remote(key, version, chain, reply);
            }
        }
    }

    fn read_from_disk(
        &mut self,
        key: CacheKey,
        version: Version,
        chain: ChainId,
        record: DiskChunkRecord,
        reply: Responder,
    ) {
        let Some(tx) = self.commands.upgrade() else {
            self.finish(&key, chain, Err(CacheError::Closed), reply);
            return;
        };
        let blobs = self.blobs.clone();
        self.pool.submit(JobKind::DiskRead, async move {
            let result = blobs.read_blob(&record.path).await;
            let _ = tx
                .send(Command::DiskRead {
                    key,
                    version,
                    chain,
                    record,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn on_disk_read(
        &mut self,
        key: CacheKey,
        version: Version,
        chain: ChainId,
        record: DiskChunkRecord,
        result: Result<Bytes, BlobStoreError>,
        reply: Responder,
    ) {
        let failure = match result {
            Ok(data) if data.len() as u64 == record.size => {
                self.metrics.hit(Tier::Disk);
                debug!(key = %key, version = record.version, size = record.size, "Disk hit");
                let asset = Asset::new(key.clone(), record.version, data);
                self.backfill_memory(asset.clone());
                self.finish(&key, chain, Ok(asset), reply);
                return;
            }
            Ok(data) => format!("size mismatch: expected {}, read {}", record.size, data.len()),
            Err(e) => e.to_string(),
        };

        warn!(key = %key, path = %record.path, error = %failure, "Disk read failed, evicting record");
        self.metrics.miss(Tier::Disk, "unreadable");
        if let Some(evicted) = self.disk.remove_if_path(&key, &record.path) {
            self.metrics.evicted(Tier::Disk, 1);
            self.delete_blobs(vec![evicted]);
        }
        self.fetch_remote(key, version, chain, reply);
    }

    fn fetch_remote(&mut self, key: CacheKey, version: Version, chain: ChainId, reply: Responder) {
        let Some(tx) = self.commands.upgrade() else {
            self.finish(&key, chain, Err(CacheError::Closed), reply);
            return;
        };
        let plan = self.remote.plan();
        self.pool.submit(JobKind::RemoteFetch, async move {
            let result = plan.run(&key, version).await;
            let _ = tx
                .send(Command::Fetched {
                    key,
                    chain,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn on_fetched(
        &mut self,
        key: CacheKey,
        chain: ChainId,
        result: Result<Asset, CacheError>,
        reply: Responder,
    ) {
        match result {
            Ok(asset) => {
                self.metrics.hit(Tier::Remote);
                self.persist_to_disk(&asset);
                self.backfill_memory(asset.clone());
                self.finish(&key, chain, Ok(asset), reply);
            }
            Err(e) => {
                self.metrics.fetch_failure();
                warn!(key = %key, error = %e, "Resolution failed");
                self.finish(&key, chain, Err(e), reply);
            }
        }
    }

    /// Index the asset and write its backing file in the background.
    fn persist_to_disk(&mut self, asset: &Asset) {
        let outcome = self.disk.save(&asset.key, asset.version, asset.size());
        self.metrics.evicted(Tier::Disk, outcome.evicted.len());
        self.delete_blobs(outcome.evicted);

        let Some(record) = outcome.record else {
            return;
        };
        let blobs = self.blobs.clone();
        let metrics = self.metrics.clone();
        let data = asset.data.clone();
        self.pool.submit(JobKind::DiskWrite, async move {
            if let Err(e) = blobs.write_blob(&record.path, &data).await {
                warn!(key = %record.key, path = %record.path, error = %e, "Failed to write blob");
                metrics.io_failure("write");
            }
        });
    }

    fn backfill_memory(&mut self, asset: Asset) {
        let evicted = self.memory.insert(asset);
        self.metrics.evicted(Tier::Memory, evicted);
    }

    /// Best-effort background deletion of evicted backing files.
    fn delete_blobs(&self, records: Vec<DiskChunkRecord>) {
        for record in records {
            let blobs = self.blobs.clone();
            let metrics = self.metrics.clone();
            self.pool.submit(JobKind::DiskDelete, async move {
                if let Err(e) = blobs.delete_blob(&record.path).await {
                    warn!(key = %record.key, path = %record.path, error = %e, "Failed to delete blob");
                    metrics.io_failure("delete");
                }
            });
        }
    }

    /// Complete traversal `chain` for `key`: answer the caller and, when the
    /// pending entry belongs to this traversal, end it, wake its waiters and
    /// drop it if nobody is waiting.
    fn finish(
        &mut self,
        key: &str,
        chain: ChainId,
        result: Result<Asset, CacheError>,
        reply: Responder,
    ) {
        if let Some(entry) = self.pending.get_mut(key) {
            if entry.chain == chain && entry.state == FetchState::Fetching {
                entry.state = FetchState::EndFetching;
                entry.signal.send_modify(|generation| *generation = generation.wrapping_add(1));
            }
        }
        reply.deliver(key, result);
        self.reap(key);
    }

    fn reap(&mut self, key: &str) {
        let idle = self
            .pending
            .get(key)
            .is_some_and(|entry| entry.state == FetchState::EndFetching && entry.waiters == 0);
        if idle {
            self.pending.remove(key);
        }
    }

    /// Snapshot the index now and write it on the pool. Index writes are
    /// serialized by the writer; a snapshot superseded by a newer write is
    /// dropped and still reported as success.
    fn persist_index(&mut self, ack: oneshot::Sender<Result<(), CacheError>>) {
        self.index_generation += 1;
        let generation = self.index_generation;
        let snapshot = self.disk.snapshot();
        let index = self.index.clone();
        let metrics = self.metrics.clone();
        self.pool.submit(JobKind::IndexWrite, async move {
            let result = index
                .write(generation, &snapshot)
                .await
                .map(|_| ())
                .map_err(CacheError::from);
            if let Err(e) = &result {
                warn!(path = %index.path().display(), error = %e, "Failed to persist disk index");
                metrics.io_failure("index");
            }
            let _ = ack.send(result);
        });
    }

    /// Write the index inline as the newest snapshot. Waits for a write in
    /// progress; writes still queued on the pool are skipped afterwards.
    pub(crate) async fn persist_index_now(&mut self) -> Result<(), CacheError> {
        self.index_generation += 1;
        self.index
            .write(self.index_generation, &self.disk.snapshot())
            .await?;
        info!(
            path = %self.index.path().display(),
            records = self.disk.len(),
            used = self.disk.used_bytes(),
            "Disk index persisted"
        );
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.len(),
            memory_used: self.memory.used_bytes(),
            memory_budget: self.memory.budget(),
            disk_entries: self.disk.len(),
            disk_used: self.disk.used_bytes(),
            disk_capacity: self.disk.capacity(),
            pending_keys: self.pending.len(),
            memory_hits: self.metrics.hits(Tier::Memory),
            disk_hits: self.metrics.hits(Tier::Disk),
            remote_hits: self.metrics.hits(Tier::Remote),
            memory_evictions: self.metrics.evictions(Tier::Memory),
            disk_evictions: self.metrics.evictions(Tier::Disk),
            coalesced_waits: self.metrics.coalesced_waits(),
            fetch_failures: self.metrics.fetch_failures(),
            io_in_flight: self.pool.in_flight_count(),
            blob_io: self.blobs.stats().counts(),
        }
    }
}
