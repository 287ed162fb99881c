//! `caches` and `Cache` facades over a [`CacheBackend`].

use std::sync::Arc;

use futures::future::join_all;
use swcache_net::{Fetcher, Request, Response};
use tracing::{debug, info, trace, warn};

use crate::{CacheBackend, CacheEntry, MemoryBackend, SharedBackend, StoreError};

/// Cache storage (the `caches` global).
///
/// Cheap to clone; every clone addresses the same backend.
#[derive(Clone)]
pub struct CacheStorage {
    backend: SharedBackend,
}

impl CacheStorage {
    /// Create cache storage over a backend.
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Process-local cache storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache, StoreError> {
        self.backend.open(name).await?;
        trace!(cache = name, "Cache opened");
        Ok(Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool, StoreError> {
        self.backend.has(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let existed = self.backend.delete(name).await?;
        if existed {
            info!(cache = name, "Cache deleted");
        }
        Ok(existed)
    }

    /// Get all cache names, oldest first.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.names().await
    }

    /// Match across all caches, oldest first.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        if request.method != http::Method::GET {
            return Ok(None);
        }
        let key = request.cache_key();
        for name in self.backend.names().await? {
            if let Some(entry) = self.backend.get(&name, &key).await? {
                trace!(cache = %name, url = %key, "Cache hit");
                return entry.to_response().map(Some);
            }
        }
        trace!(url = %key, "Cache miss");
        Ok(None)
    }
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

/// A cache instance.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        if request.method != http::Method::GET {
            return Ok(None);
        }
        match self.backend.get(&self.name, &request.cache_key()).await? {
            Some(entry) => entry.to_response().map(Some),
            None => Ok(None),
        }
    }

    /// Look up the raw entry for a request.
    pub async fn entry(&self, request: &Request) -> Result<Option<CacheEntry>, StoreError> {
        self.backend.get(&self.name, &request.cache_key()).await
    }

    /// Store a response for a request, replacing any previous entry.
    ///
    /// Consumes `response`; tee it first if the caller still needs it.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), StoreError> {
        let entry = CacheEntry::from_response(request, response).await?;
        debug!(cache = %self.name, url = %entry.url, status = entry.status, bytes = entry.body.len(), "Cache put");
        self.backend.put(&self.name, vec![entry]).await
    }

    /// Fetch every request and store all responses.
    ///
    /// Requests are fetched concurrently. Any network error or non-2xx status
    /// fails the whole batch and nothing is stored.
    pub async fn add_all(&self, requests: &[Request], fetcher: &dyn Fetcher) -> Result<(), StoreError> {
        let fetches = requests.iter().map(|request| async move {
            let url = request.cache_key();
            let response = fetcher
                .fetch(request)
                .await
                .map_err(|source| StoreError::FetchFailed {
                    url: url.clone(),
                    source,
                })?;
            if !response.ok() {
                return Err(StoreError::BadStatus {
                    url,
                    status: response.status.as_u16(),
                });
            }
            CacheEntry::from_response(request, response).await
        });

        let mut entries = Vec::with_capacity(requests.len());
        for result in join_all(fetches).await {
            match result {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(cache = %self.name, error = %e, "addAll rejected");
                    return Err(e);
                }
            }
        }

        info!(cache = %self.name, count = entries.len(), "addAll stored");
        self.backend.put(&self.name, entries).await
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> Result<bool, StoreError> {
        self.backend.remove(&self.name, &request.cache_key()).await
    }

    /// Get all keys (URLs).
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.keys(&self.name).await
    }

    /// Number of entries.
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys().await?.len())
    }

    /// Whether the cache has no entries.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}
