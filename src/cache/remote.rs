//! Remote tier: obtains bytes when no cache tier holds a fresh copy.
//!
//! The tier is transport-agnostic. It holds an optional primary transport and
//! an optional registered fallback strategy, both behind the [`Fetcher`]
//! trait. A load tries the transport first and the fallback on failure.
//! There are no automatic retries beyond that single fallback step.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::asset::{Asset, Version};
use crate::cache::error::CacheError;
use crate::config::RemoteConfig;

/// A pluggable asset-fetch strategy supplied by the host application.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the bytes for `key` at (at least) `version`.
    async fn fetch(&self, key: &str, version: Version) -> anyhow::Result<Bytes>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "fetcher"
    }
}

/// Stock transport: treats the key as a URL and issues a GET.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &str, _version: Version) -> anyhow::Result<Bytes> {
        let response = self
            .client
            .get(key)
            .send()
            .await
            .with_context(|| format!("requesting {key}"))?
            .error_for_status()?;
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {key}"))?;
        Ok(body)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Remote tier state, owned by the coordinator.
#[derive(Default)]
pub struct RemoteTier {
    transport: Option<Arc<dyn Fetcher>>,
    fallback: Option<Arc<dyn Fetcher>>,
}

impl RemoteTier {
    pub fn new(transport: Option<Arc<dyn Fetcher>>) -> Self {
        Self {
            transport,
            fallback: None,
        }
    }

    /// Register the fallback strategy.
    ///
    /// Replace semantics: a later registration supersedes an earlier one, so
    /// registering twice never causes a double invocation. Returns whether a
    /// previous fallback was replaced.
    pub fn set_fallback(&mut self, fetcher: Arc<dyn Fetcher>) -> bool {
        self.fallback.replace(fetcher).is_some()
    }

    /// Capture the current strategies for one load. The plan runs off the
    /// control loop, so registrations made while it is in flight do not
    /// affect it.
    pub fn plan(&self) -> FetchPlan {
        FetchPlan {
            transport: self.transport.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

/// The strategies to try for a single remote load.
#[derive(Clone)]
pub struct FetchPlan {
    transport: Option<Arc<dyn Fetcher>>,
    fallback: Option<Arc<dyn Fetcher>>,
}

impl FetchPlan {
    /// Run the load: transport first, fallback on failure.
    pub async fn run(self, key: &str, version: Version) -> Result<Asset, CacheError> {
        if self.transport.is_none() && self.fallback.is_none() {
            return Err(CacheError::NoFetcher {
                key: key.to_string(),
            });
        }

        let mut last_error = None;

        for fetcher in [self.transport, self.fallback].into_iter().flatten() {
            match fetcher.fetch(key, version).await {
                Ok(data) => {
                    debug!(key, version, via = fetcher.name(), size = data.len(), "Remote hit");
                    return Ok(Asset::new(key, version, data));
                }
                Err(e) => {
                    warn!(key, version, via = fetcher.name(), error = %e, "Remote fetch failed");
                    last_error = Some(e);
                }
            }
        }

        Err(CacheError::Fetch {
            key: key.to_string(),
            version,
            reason: last_error
                .map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "no strategy produced a result".to_string()),
        })
    }
}
