//! Runtime configuration for asset-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (budgets, paths, coalescing wait, worker limits) live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::disk::DEFAULT_DISK_CAPACITY;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "asset-cache-tier", about = "Tiered asset cache (memory → disk → remote)")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Resolve one or more keys (URLs) and report where each came from.
    Fetch {
        /// Keys to resolve.
        #[arg(required = true)]
        keys: Vec<String>,

        /// Minimum acceptable version.
        #[arg(long, default_value_t = 0)]
        version: u64,
    },

    /// Pre-populate the cache from a JSON manifest of `{"key", "version"}` entries.
    Prewarm {
        manifest: PathBuf,
    },

    /// Print disk index usage and counters.
    Stats,

    /// Change the disk budget and evict down to it.
    SetCapacity {
        bytes: u64,
    },

    /// Delete backing files no index record refers to.
    Sweep,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tier budgets and storage paths.
    pub tiers: TierConfig,

    /// Request coalescing.
    pub coalescing: CoalescingConfig,

    /// Background worker limits.
    pub workers: WorkerConfig,

    /// Remote transport settings.
    pub remote: RemoteConfig,
}

/// Tier capacity and path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Memory tier budget in bytes (0 disables the memory tier).
    pub memory_budget: u64,

    /// Disk tier budget in bytes, used on cold start. A persisted index
    /// carrying its own capacity overrides this.
    pub disk_budget: u64,

    /// Directory for backing files.
    pub blob_dir: PathBuf,

    /// Location of the persisted disk index.
    pub index_path: PathBuf,

    /// Remove unreferenced backing files at startup.
    pub sweep_orphans_on_start: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            memory_budget: 64 * 1024 * 1024, // 64 MiB
            disk_budget: DEFAULT_DISK_CAPACITY,
            blob_dir: PathBuf::from("/tmp/asset-cache/blobs"),
            index_path: PathBuf::from("/tmp/asset-cache/asset_index.json"),
            sweep_orphans_on_start: false,
        }
    }
}

/// Coalescing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescingConfig {
    /// How long a duplicate request waits for the in-flight one before
    /// re-checking the tiers itself.
    pub wait_timeout_ms: u64,
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 2000,
        }
    }
}

impl CoalescingConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Worker pool and control loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrent file operations and fetches.
    pub max_concurrent_io: usize,

    /// Capacity of the control loop's command queue.
    pub command_queue: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_io: 8,
            command_queue: 1024,
        }
    }
}

/// Remote transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// User-Agent header for the HTTP transport.
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            user_agent: format!("asset-cache-tier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Configuration rooted in a single directory, handy for tests and tools.
    pub fn in_dir(dir: &std::path::Path) -> Self {
        let mut config = Config::default();
        config.tiers.blob_dir = dir.join("blobs");
        config.tiers.index_path = dir.join("asset_index.json");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.tiers.disk_budget, 500 * 1024 * 1024);
        assert_eq!(cfg.coalescing.wait_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.workers.max_concurrent_io, 8);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"tiers": {"disk_budget": 1000}, "coalescing": {}}"#).unwrap();
        assert_eq!(cfg.tiers.disk_budget, 1000);
        assert_eq!(cfg.tiers.memory_budget, 64 * 1024 * 1024);
        assert_eq!(cfg.coalescing.wait_timeout_ms, 2000);
    }

    #[test]
    fn test_cli_parses_fetch() {
        let cli = Cli::parse_from(["asset-cache-tier", "fetch", "http://a/x.png", "--version", "3"]);
        match cli.command {
            Command::Fetch { keys, version } => {
                assert_eq!(keys, vec!["http://a/x.png".to_string()]);
                assert_eq!(version, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
