//! # swcache Agent
//!
//! The offline cache agent and the service worker host that drives it.
//!
//! ## Features
//!
//! - **Install**: pre-cache the asset list into the current bucket
//! - **Activate**: delete stale buckets and claim open pages
//! - **Fetch**: network-first for navigations, cache-first for subresources
//! - **Lifecycle**: installing / waiting / active slots per registration
//! - **Clients**: controller tracking for open pages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (navigator.serviceWorker)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker) ──► LifecycleHandler + WorkerScope
//!     │
//!     ├── Clients (open pages and their controller)
//!     │
//!     └── CacheStorage (caches)
//!             └── Cache ── CacheBackend (memory | sqlite)
//! ```

use thiserror::Error;

mod agent;
mod clients;
mod container;
mod scope;
mod worker;

pub use agent::OfflineCacheAgent;
pub use clients::{Client, ClientType, Clients};
pub use container::{RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent};
pub use scope::{LifecycleHandler, WorkerScope};
pub use worker::{ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState};

use swcache_net::NetError;
use swcache_store::StoreError;

/// Errors that can occur in agent and host operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Install failed: {0}")]
    InstallFailed(#[source] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] swcache_common::SwCacheError),

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("No response for {0}")]
    NoResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
