//! Per-cache prometheus counters.
//!
//! Each cache owns its own `Registry` so several caches (and tests) can live
//! in one process without clashing on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::cache::asset::Tier;
use crate::transfer::worker_pool::JobKind;

#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounterVec,
    evictions: IntCounterVec,
    coalesced_waits: IntCounter,
    fetch_failures: IntCounter,
    io_failures: IntCounterVec,
    worker_jobs: IntCounterVec,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("asset_cache".to_string()), None)?;

        let hits = IntCounterVec::new(Opts::new("hits_total", "Lookups served per tier"), &["tier"])?;
        let misses = IntCounterVec::new(
            Opts::new("misses_total", "Lookups that fell through, per tier and reason"),
            &["tier", "reason"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("evictions_total", "Entries evicted per tier"),
            &["tier"],
        )?;
        let coalesced_waits = IntCounter::new(
            "coalesced_waits_total",
            "Requests that waited on an in-flight resolution",
        )?;
        let fetch_failures = IntCounter::new(
            "fetch_failures_total",
            "Resolutions that failed terminally in the remote tier",
        )?;
        let io_failures = IntCounterVec::new(
            Opts::new("io_failures_total", "Best-effort file operations that failed"),
            &["op"],
        )?;

        let worker_jobs = IntCounterVec::new(
            Opts::new("worker_jobs_total", "Background jobs completed by the worker pool, per kind"),
            &["kind"],
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(coalesced_waits.clone()))?;
        registry.register(Box::new(fetch_failures.clone()))?;
        registry.register(Box::new(io_failures.clone()))?;
        registry.register(Box::new(worker_jobs.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            coalesced_waits,
            fetch_failures,
            io_failures,
            worker_jobs,
        })
    }

    pub fn hit(&self, tier: Tier) {
        self.hits.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn miss(&self, tier: Tier, reason: &str) {
        self.misses.with_label_values(&[tier.as_str(), reason]).inc();
    }

    pub fn evicted(&self, tier: Tier, count: usize) {
        if count > 0 {
            self.evictions
                .with_label_values(&[tier.as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn coalesced_wait(&self) {
        self.coalesced_waits.inc();
    }

    pub fn fetch_failure(&self) {
        self.fetch_failures.inc();
    }

    pub fn io_failure(&self, op: &str) {
        self.io_failures.with_label_values(&[op]).inc();
    }

    pub fn job_finished(&self, kind: JobKind) {
        self.worker_jobs.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn hits(&self, tier: Tier) -> u64 {
        self.hits.with_label_values(&[tier.as_str()]).get()
    }

    pub fn evictions(&self, tier: Tier) -> u64 {
        self.evictions.with_label_values(&[tier.as_str()]).get()
    }

    pub fn coalesced_waits(&self) -> u64 {
        self.coalesced_waits.get()
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.get()
    }

    pub fn worker_jobs(&self, kind: JobKind) -> u64 {
        self.worker_jobs.with_label_values(&[kind.as_str()]).get()
    }

    /// Render all counters in the text exposition format.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_text() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.hit(Tier::Memory);
        metrics.hit(Tier::Memory);
        metrics.evicted(Tier::Disk, 3);
        metrics.evicted(Tier::Disk, 0);

        assert_eq!(metrics.hits(Tier::Memory), 2);
        assert_eq!(metrics.hits(Tier::Disk), 0);
        assert_eq!(metrics.evictions(Tier::Disk), 3);

        let text = metrics.gather_text();
        assert!(text.contains("asset_cache_hits_total"));
    }

    #[test]
    fn test_independent_registries() {
        let a = CacheMetrics::new().unwrap();
        let b = CacheMetrics::new().unwrap();
        a.fetch_failure();
        assert_eq!(a.fetch_failures(), 1);
        assert_eq!(b.fetch_failures(), 0);
    }
}
