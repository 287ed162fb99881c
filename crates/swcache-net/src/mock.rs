//! Scripted in-memory network for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::RwLock;

use crate::{cache_key, Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
struct MockRoute {
    status: StatusCode,
    content_type: Option<&'static str>,
    body: Bytes,
}

/// A [`Fetcher`] that answers from a route table and counts every call.
///
/// Unknown URLs answer `404`. While offline every fetch fails with
/// [`NetError::RequestFailed`], but still counts as a call.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: RwLock<HashMap<String, MockRoute>>,
    calls: RwLock<HashMap<String, usize>>,
    total_calls: AtomicUsize,
    offline: AtomicBool,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `200 OK` route.
    pub fn with_route(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.with_status(url, StatusCode::OK, body)
    }

    /// Add a route with an explicit status.
    pub fn with_status(mut self, url: &str, status: StatusCode, body: impl Into<Bytes>) -> Self {
        self.routes.get_mut().insert(
            url.to_string(),
            MockRoute {
                status,
                content_type: None,
                body: body.into(),
            },
        );
        self
    }

    /// Add a `200 OK` route with a Content-Type header.
    pub fn with_typed_route(mut self, url: &str, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        self.routes.get_mut().insert(
            url.to_string(),
            MockRoute {
                status: StatusCode::OK,
                content_type: Some(content_type),
                body: body.into(),
            },
        );
        self
    }

    /// Replace the body served for a URL.
    pub async fn set_route(&self, url: &str, body: impl Into<Bytes>) {
        self.routes.write().await.insert(
            url.to_string(),
            MockRoute {
                status: StatusCode::OK,
                content_type: None,
                body: body.into(),
            },
        );
    }

    /// Toggle network availability.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total fetches so far.
    pub fn calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Fetches for one URL so far.
    pub async fn calls_for(&self, url: &str) -> usize {
        self.calls.read().await.get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = cache_key(&request.url);
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self.calls.write().await.entry(key.clone()).or_insert(0) += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed(format!("{}: network unreachable", key)));
        }

        let route = self.routes.read().await.get(&key).cloned();
        let response = match route {
            Some(route) => {
                let mut headers = HeaderMap::new();
                if let Some(content_type) = route.content_type {
                    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
                }
                Response::new(request.url.clone(), route.status, headers, route.body)
            }
            None => Response::new(request.url.clone(), StatusCode::NOT_FOUND, HeaderMap::new(), ""),
        };
        Ok(response)
    }
}
