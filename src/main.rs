//! asset-cache-tier CLI.
//!
//! Drives the tiered cache from the command line: resolve keys (as URLs over
//! HTTP), pre-warm from a manifest, inspect or resize the disk tier, and
//! sweep orphaned backing files.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};

use asset_cache_tier::cache::service::{read_persisted_index, sweep_orphans};
use asset_cache_tier::config::{Cli, Command, Config};
use asset_cache_tier::{AssetCache, CacheKey, HttpFetcher, Version};

/// One pre-warm manifest entry.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    key: CacheKey,
    #[serde(default)]
    version: Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "asset_cache_tier=debug"
    } else {
        "asset_cache_tier=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("asset-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);

    info!(
        memory_budget = config.tiers.memory_budget,
        disk_budget = config.tiers.disk_budget,
        blob_dir = %config.tiers.blob_dir.display(),
        index = %config.tiers.index_path.display(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Stats => {
            // Offline: read the index without spinning up the control loop.
            match read_persisted_index(&config.tiers.index_path).await? {
                Some(snapshot) => {
                    println!("records:  {}", snapshot.map.len());
                    println!("used:     {} bytes", snapshot.use_size);
                    println!("capacity: {} bytes", snapshot.capacity);
                    for key in &snapshot.queue {
                        if let Some(record) = snapshot.map.get(key) {
                            println!("  {key} v{} {} bytes ({})", record.version, record.size, record.path);
                        }
                    }
                }
                None => println!("no persisted index (cold start)"),
            }
            return Ok(());
        }
        Command::Sweep => {
            let removed = sweep_orphans(&config).await?;
            println!("removed {removed} orphaned blob(s)");
            return Ok(());
        }
        _ => {}
    }

    let transport = Arc::new(HttpFetcher::new(&config.remote)?);
    let cache = AssetCache::start(config.clone(), Some(transport)).await?;

    match cli.command {
        Command::Fetch { keys, version } => {
            let mut failures = 0;
            for key in keys {
                let start = Instant::now();
                match cache.resolve(key.clone(), version).await {
                    Ok(asset) => println!(
                        "{key} v{} {} bytes in {:?}",
                        asset.version,
                        asset.size(),
                        start.elapsed()
                    ),
                    Err(e) => {
                        error!(key = %key, error = %e, "Resolve failed");
                        failures += 1;
                    }
                }
            }
            let stats = cache.stats().await?;
            println!(
                "hits: memory={} disk={} remote={}, failures={failures}",
                stats.memory_hits, stats.disk_hits, stats.remote_hits
            );
        }
        Command::Prewarm { manifest } => {
            let data = std::fs::read_to_string(&manifest)
                .with_context(|| format!("reading manifest {}", manifest.display()))?;
            let entries: Vec<ManifestEntry> = serde_json::from_str(&data)?;
            let count = entries.len() as u64;
            cache
                .prewarm(entries.into_iter().map(|e| (e.key, e.version)))
                .await?;

            // Wait for the batch to drain before persisting.
            loop {
                let stats = cache.stats().await?;
                if stats.remote_hits + stats.disk_hits + stats.memory_hits + stats.fetch_failures >= count
                    && stats.pending_keys == 0
                {
                    println!(
                        "pre-warmed {} asset(s), {} failure(s)",
                        count - stats.fetch_failures.min(count),
                        stats.fetch_failures
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        Command::SetCapacity { bytes } => {
            let evicted = cache.set_disk_capacity(bytes).await?;
            println!("capacity set to {bytes} bytes, evicted {evicted} record(s)");
        }
        // Served offline above.
        Command::Stats | Command::Sweep => {}
    }

    print!("{}", cache.metrics_text());
    cache.shutdown().await?;
    Ok(())
}
