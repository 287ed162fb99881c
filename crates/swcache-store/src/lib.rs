//! # swcache Store
//!
//! Cache Storage for the swcache offline agent: named buckets mapping a
//! request to a stored response.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     │
//!     └── Cache (one named bucket)
//!             └── Request → CacheEntry
//!
//! CacheBackend
//!     ├── MemoryBackend
//!     └── SqliteBackend
//! ```
//!
//! Buckets are keyed by URL without fragment. Only `GET` requests are ever
//! matched or stored.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use swcache_net::{NetError, Request, Response};
use thiserror::Error;
use url::Url;

mod cache;
pub mod memory;
pub mod sqlite;

pub use cache::{Cache, CacheStorage};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

// ==================== Errors ====================

/// Errors that can occur in cache storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    #[error("Request method {0} is not cacheable")]
    UnsupportedMethod(String),

    #[error("Partial response cannot be cached: {0}")]
    PartialResponse(String),

    #[error("Response with Vary: * cannot be cached: {0}")]
    VaryWildcard(String),

    #[error("Fetch failed for {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Reading response body failed: {0}")]
    Body(#[source] NetError),

    #[error("Corrupt entry for {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Request URL without fragment; the key within a bucket.
    pub url: String,

    /// Request method. Always `GET` for stored entries.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Values are raw bytes; they need not
    /// be ASCII.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Build an entry from a request and the response to store for it.
    ///
    /// Consumes the response body; callers that still need the response must
    /// [`Response::tee`] it first.
    pub async fn from_response(request: &Request, response: Response) -> Result<Self, StoreError> {
        check_storable(request, &response)?;

        let status = response.status.as_u16();
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response.bytes().await.map_err(StoreError::Body)?;

        Ok(Self {
            url: request.cache_key(),
            method: request.method.as_str().to_string(),
            status,
            headers,
            body,
            cached_at: now_millis(),
        })
    }

    /// Rebuild a fresh response. Every call yields an independent body.
    pub fn to_response(&self) -> Result<Response, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptEntry {
            key: self.url.clone(),
            reason,
        };

        let url = Url::parse(&self.url).map_err(|e| corrupt(e.to_string()))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| corrupt(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| corrupt(e.to_string()))?;
            let value = HeaderValue::from_bytes(value).map_err(|e| corrupt(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

/// Reject what the Cache API refuses to store.
fn check_storable(request: &Request, response: &Response) -> Result<(), StoreError> {
    if request.method != Method::GET {
        return Err(StoreError::UnsupportedMethod(request.method.to_string()));
    }
    if response.status == StatusCode::PARTIAL_CONTENT {
        return Err(StoreError::PartialResponse(request.cache_key()));
    }
    let vary_wildcard = response
        .headers
        .get_all(http::header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|field| field.trim() == "*"));
    if vary_wildcard {
        return Err(StoreError::VaryWildcard(request.cache_key()));
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Backend ====================

/// Storage engine behind [`CacheStorage`].
///
/// Bucket names are listed in creation order; entry keys in insertion order.
/// Writes are blind keyed overwrites.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the bucket if it does not exist.
    async fn open(&self, name: &str) -> Result<(), StoreError>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// Delete a bucket and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// All bucket names.
    async fn names(&self) -> Result<Vec<String>, StoreError>;

    /// Look up one entry.
    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Store a batch of entries. Either all of them land or none does.
    async fn put(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError>;

    /// Remove one entry. Returns whether it existed.
    async fn remove(&self, name: &str, key: &str) -> Result<bool, StoreError>;

    /// All entry keys of a bucket.
    async fn keys(&self, name: &str) -> Result<Vec<String>, StoreError>;
}

/// Shared backend handle.
pub type SharedBackend = Arc<dyn CacheBackend>;
