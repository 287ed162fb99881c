//! What a running worker sees: its caches, the network and its clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use swcache_net::{Fetcher, NetError, Request, Response};
use swcache_store::CacheStorage;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use url::Url;

use crate::{AgentError, Clients, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState};

/// Lifecycle events delivered by the host.
///
/// The returned futures are the pending work the host waits on before
/// moving the worker to its next state.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// `install` event. An error makes the worker redundant.
    async fn on_install(&self, scope: &WorkerScope) -> Result<(), AgentError>;

    /// `activate` event.
    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), AgentError>;

    /// `fetch` event. `Ok(None)` means the worker has no response to give.
    async fn on_fetch(&self, scope: &WorkerScope, request: &Request) -> Result<Option<Response>, AgentError>;
}

/// Global scope of one worker (`self` inside the worker script).
pub struct WorkerScope {
    worker_id: ServiceWorkerId,
    scope: Url,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    skip_waiting: AtomicBool,
    state: RwLock<ServiceWorkerState>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl WorkerScope {
    pub(crate) fn new(
        worker_id: ServiceWorkerId,
        scope: Url,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<RwLock<Clients>>,
        event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Self {
        Self {
            worker_id,
            scope,
            caches,
            fetcher,
            clients,
            skip_waiting: AtomicBool::new(false),
            state: RwLock::new(ServiceWorkerState::Parsed),
            event_tx,
        }
    }

    /// ID of the worker this scope belongs to.
    pub fn worker_id(&self) -> ServiceWorkerId {
        self.worker_id
    }

    /// Registration scope URL.
    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Cache storage (`caches`).
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// The network.
    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    /// `fetch()` from inside the worker. Never re-enters the worker.
    pub async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.fetcher.fetch(request).await
    }

    /// `self.skipWaiting()`: activate as soon as install finishes.
    pub fn skip_waiting(&self) {
        debug!(worker = %self.worker_id, "skipWaiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Current lifecycle state of this worker.
    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: ServiceWorkerState) {
        *self.state.write().await = state;
    }

    /// `clients.claim()`: control every open page in scope.
    ///
    /// Only an activating or activated worker may claim.
    pub async fn claim_clients(&self) -> Result<Vec<String>, AgentError> {
        let state = self.state().await;
        if !matches!(state, ServiceWorkerState::Activating | ServiceWorkerState::Activated) {
            return Err(AgentError::StateError(format!(
                "{} cannot claim clients while {:?}",
                self.worker_id, state
            )));
        }

        let changed = self.clients.write().await.claim(self.worker_id, &self.scope);
        for client_id in &changed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: self.worker_id,
            });
        }
        debug!(worker = %self.worker_id, claimed = changed.len(), "Clients claimed");
        Ok(changed)
    }
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope")
            .field("worker_id", &self.worker_id)
            .field("scope", &self.scope.as_str())
            .finish_non_exhaustive()
    }
}
