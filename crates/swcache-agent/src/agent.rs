//! The offline cache agent.
//!
//! Install pre-caches a fixed asset list into a version-named bucket,
//! activate drops every other bucket, and fetch routes each request:
//!
//! 1. Navigation: network first, refresh the bucket, fall back to the cache
//!    when the network fails
//! 2. Anything else: cache first, fill the bucket on a miss

use async_trait::async_trait;
use futures::future::join_all;
use swcache_common::AgentConfig;
use swcache_net::{Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::{AgentError, LifecycleHandler, WorkerScope};

/// Offline cache agent for one deploy.
#[derive(Debug, Clone)]
pub struct OfflineCacheAgent {
    /// Version identifier naming the current bucket.
    cache_name: String,

    /// Absolute asset URLs, in list order.
    assets: Vec<Url>,
}

impl OfflineCacheAgent {
    /// Build an agent from configuration, resolving relative assets
    /// against the scope.
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            cache_name: config.cache_name.clone(),
            assets: config.asset_urls()?,
        })
    }

    /// Build an agent from an already resolved asset list.
    pub fn with_assets(cache_name: impl Into<String>, assets: Vec<Url>) -> Self {
        Self {
            cache_name: cache_name.into(),
            assets,
        }
    }

    /// Name of the current bucket.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Pre-cached assets.
    pub fn assets(&self) -> &[Url] {
        &self.assets
    }

    /// Network first, cache as fallback.
    async fn network_first(&self, scope: &WorkerScope, request: &Request) -> Result<Option<Response>, AgentError> {
        let fresh = match scope.fetch(request).await {
            Ok(response) => response.tee().await,
            Err(e) => Err(e),
        };

        match fresh {
            Ok((for_page, for_cache)) => {
                self.store(scope, request, for_cache).await;
                Ok(Some(for_page))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation offline, trying cache");
                let cached = scope.caches().match_request(request).await?;
                if cached.is_none() {
                    debug!(url = %request.url, "No cached copy of page");
                }
                Ok(cached)
            }
        }
    }

    /// Cache first, network on a miss.
    async fn cache_first(&self, scope: &WorkerScope, request: &Request) -> Result<Option<Response>, AgentError> {
        if let Some(cached) = scope.caches().match_request(request).await? {
            debug!(url = %request.url, "Served from cache");
            return Ok(Some(cached));
        }

        let (for_page, for_cache) = scope.fetch(request).await?.tee().await?;
        self.store(scope, request, for_cache).await;
        Ok(Some(for_page))
    }

    /// Write a response copy into the current bucket. Failures are logged,
    /// the page still gets its response.
    async fn store(&self, scope: &WorkerScope, request: &Request, response: Response) {
        let result = match scope.caches().open(&self.cache_name).await {
            Ok(cache) => cache.put(request, response).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(cache = %self.cache_name, url = %request.url, error = %e, "Cache write skipped");
        }
    }
}

#[async_trait]
impl LifecycleHandler for OfflineCacheAgent {
    async fn on_install(&self, scope: &WorkerScope) -> Result<(), AgentError> {
        scope.skip_waiting();

        let cache = scope
            .caches()
            .open(&self.cache_name)
            .await
            .map_err(AgentError::InstallFailed)?;

        let mut missing = Vec::new();
        for url in &self.assets {
            let request = Request::get(url.clone());
            if cache
                .entry(&request)
                .await
                .map_err(AgentError::InstallFailed)?
                .is_none()
            {
                missing.push(request);
            }
        }

        info!(
            cache = %self.cache_name,
            assets = self.assets.len(),
            missing = missing.len(),
            "Pre-caching assets"
        );
        cache
            .add_all(&missing, scope.fetcher())
            .await
            .map_err(AgentError::InstallFailed)
    }

    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), AgentError> {
        let caches = scope.caches();
        let stale: Vec<String> = caches
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != &self.cache_name)
            .collect();

        let results = join_all(stale.iter().map(|name| caches.delete(name))).await;
        for (name, result) in stale.iter().zip(results) {
            if let Err(e) = result {
                warn!(cache = %name, error = %e, "Failed to delete stale cache");
            }
        }

        let claimed = scope.claim_clients().await?;
        info!(cache = %self.cache_name, deleted = stale.len(), claimed = claimed.len(), "Agent activated");
        Ok(())
    }

    async fn on_fetch(&self, scope: &WorkerScope, request: &Request) -> Result<Option<Response>, AgentError> {
        if request.is_navigation() {
            self.network_first(scope, request).await
        } else {
            self.cache_first(scope, request).await
        }
    }
}
