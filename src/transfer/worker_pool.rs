//! Bounded worker pool for blocking-ish background work.
//!
//! Disk reads, writes, deletes, index writes and remote fetches all run here,
//! never on the control loop. A semaphore caps how many run at once; jobs
//! beyond the cap wait for a permit, which is where backpressure comes from.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::metrics::CacheMetrics;

/// Kind of background job, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    DiskRead,
    DiskWrite,
    DiskDelete,
    IndexWrite,
    RemoteFetch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DiskRead => "disk_read",
            JobKind::DiskWrite => "disk_write",
            JobKind::DiskDelete => "disk_delete",
            JobKind::IndexWrite => "index_write",
            JobKind::RemoteFetch => "remote_fetch",
        }
    }
}

/// Cheap to clone; clones share permits and counters.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    metrics: CacheMetrics,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrent` jobs at once.
    pub fn new(max_concurrent: usize, metrics: CacheMetrics) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics,
        }
    }

    /// Submit a job. It starts once a permit is free.
    pub fn submit<F>(&self, kind: JobKind, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(kind = kind.as_str(), "Worker pool closed, dropping job");
                    return;
                }
            };
            in_flight.fetch_add(1, Ordering::Relaxed);
            debug!(kind = kind.as_str(), "Job started");

            job.await;

            in_flight.fetch_sub(1, Ordering::Relaxed);
            metrics.job_finished(kind);
        })
    }

    /// Number of jobs currently holding a permit.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
