//! Shared fetch strategies and helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, Semaphore};

use asset_cache_tier::cache::disk::DiskIndexSnapshot;
use asset_cache_tier::{AssetCache, Fetcher, Version};

/// Fetcher returning `size` bytes of `key`'s first byte, counting calls.
///
/// When gated, each fetch waits for one permit before answering.
pub struct MockFetcher {
    pub calls: AtomicUsize,
    pub started: Notify,
    size: usize,
    fail: bool,
    gate: Option<Semaphore>,
}

impl MockFetcher {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            size,
            fail: false,
            gate: None,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            size: 0,
            fail: true,
            gate: None,
        })
    }

    /// A fetcher that blocks until [`MockFetcher::release`] hands out permits.
    pub fn gated(size: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            size,
            fail: false,
            gate: Some(Semaphore::new(0)),
        })
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, key: &str, _version: Version) -> anyhow::Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if self.fail {
            anyhow::bail!("origin unavailable");
        }
        let fill = key.bytes().next().unwrap_or(0);
        Ok(Bytes::from(vec![fill; self.size]))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Poll `check` until it returns true, panicking after a few seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the backing file for `key` exists with the recorded size.
pub async fn wait_for_blob(cache: &AssetCache, blob_dir: &Path, key: &str) {
    wait_until("blob write", || async move {
        let snapshot: DiskIndexSnapshot = cache.disk_snapshot().await.unwrap();
        match snapshot.map.get(key) {
            Some(record) => tokio::fs::metadata(blob_dir.join(&record.path))
                .await
                .map(|meta| meta.len() == record.size)
                .unwrap_or(false),
            None => false,
        }
    })
    .await;
}
