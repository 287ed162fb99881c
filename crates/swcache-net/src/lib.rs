//! # swcache Net
//!
//! Requests, responses and network fetching for the swcache offline agent.
//!
//! ## Design Goals
//!
//! 1. **Navigation-aware requests**: every request carries its [`RequestMode`]
//! 2. **Single-read bodies**: reading a [`Response`] body consumes it; use
//!    [`Response::tee`] to hand the same response to two consumers
//! 3. **Injectable network**: the agent only sees the [`Fetcher`] trait

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod loader;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use loader::{LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Body stream failed: {0}")]
    BodyStream(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring `Request.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load (address bar, link click, reload).
    Navigate,
    /// Same-origin only subresource.
    SameOrigin,
    /// Opaque cross-origin subresource (images, scripts without CORS).
    NoCors,
    /// CORS subresource, the default for `fetch()`.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            timeout: None,
        }
    }

    /// Create a navigation (document) request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request loads a new top-level document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Key used by cache storage: the URL without its fragment.
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Cache key for a URL. Fragments never reach the network so they are dropped.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// HTTP response.
///
/// The body can be read once. [`Response::bytes`] and [`Response::text`] take
/// `self`, so a second read does not compile; call [`Response::tee`] first when
/// two consumers need the body.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ResponseBody,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

impl ResponseBody {
    async fn into_bytes(self) -> Result<Bytes, NetError> {
        match self {
            ResponseBody::Full(b) => Ok(b),
            ResponseBody::Stream(mut rx) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
            ResponseBody::Empty => Ok(Bytes::new()),
        }
    }
}

impl Response {
    /// Create a response with a fully buffered body.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            url,
            status,
            headers,
            body: if body.is_empty() {
                ResponseBody::Empty
            } else {
                ResponseBody::Full(body)
            },
        }
    }

    /// Create a response whose body arrives in chunks over a channel.
    pub fn from_stream(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        chunks: mpsc::Receiver<Result<Bytes, NetError>>,
    ) -> Self {
        Self {
            url,
            status,
            headers,
            body: ResponseBody::Stream(chunks),
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Whether the body is still arriving from the network.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        self.body.into_bytes().await
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Split into two independent responses with the same status, headers and body.
    ///
    /// A streaming body is drained once and buffered. Reading either copy
    /// leaves the other intact.
    pub async fn tee(self) -> Result<(Response, Response), NetError> {
        let Response {
            url,
            status,
            headers,
            body,
        } = self;
        let body = body.into_bytes().await?;

        let first = Response::new(url.clone(), status, headers.clone(), body.clone());
        let second = Response::new(url, status, headers, body);
        Ok((first, second))
    }
}

/// Anything that can put a request on the wire.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a request. HTTP error statuses are responses, not errors.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
