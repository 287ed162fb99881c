//! Service worker host (`navigator.serviceWorker`).
//!
//! Drives registrations through install and activate, tracks which worker
//! controls each page and routes page requests to the right worker.

use std::sync::Arc;

use hashbrown::HashMap;
use swcache_common::SwCacheError;
use swcache_net::{Fetcher, Request, Response};
use swcache_store::CacheStorage;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    AgentError, Client, Clients, LifecycleHandler, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState, WorkerScope,
};

/// Registration options.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the directory of the script.
    pub scope: Option<String>,
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Update found.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// A worker that has a script behind it.
struct RunningWorker {
    handler: Arc<dyn LifecycleHandler>,
    scope: Arc<WorkerScope>,
}

/// Service worker container.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: RwLock<HashMap<String, ServiceWorkerRegistration>>,

    /// Installing, waiting and active workers.
    workers: RwLock<HashMap<ServiceWorkerId, RunningWorker>>,

    /// Open pages.
    clients: Arc<RwLock<Clients>>,

    /// Cache storage shared by every worker.
    caches: CacheStorage,

    /// Network used by workers and by uncontrolled pages.
    fetcher: Arc<dyn Fetcher>,

    /// Serializes install and activate.
    lifecycle: Mutex<()>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: RwLock::new(HashMap::new()),
                workers: RwLock::new(HashMap::new()),
                clients: Arc::new(RwLock::new(Clients::new())),
                caches,
                fetcher,
                lifecycle: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Cache storage (`caches`).
    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Register a worker script and run its install. Activates right away
    /// when the worker asked to skip waiting or nothing else is serving pages.
    ///
    /// An install failure leaves any previous worker in place. A scope whose
    /// first install fails is not registered.
    pub async fn register(
        &self,
        script_url: &str,
        handler: Arc<dyn LifecycleHandler>,
        options: RegistrationOptions,
    ) -> Result<ServiceWorkerId, AgentError> {
        let script_url = Url::parse(script_url).map_err(SwCacheError::from)?;
        let scope = match options.scope {
            Some(s) => Url::parse(&s).map_err(SwCacheError::from)?,
            None => script_url.join("./").map_err(SwCacheError::from)?,
        };
        let scope_key = scope.to_string();

        let _lifecycle = self.lifecycle.lock().await;

        let worker_id = self
            .registrations
            .write()
            .await
            .entry(scope_key.clone())
            .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()))
            .update(script_url.clone());

        let worker_scope = Arc::new(WorkerScope::new(
            worker_id,
            scope,
            self.caches.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.clients),
            self.event_tx.clone(),
        ));
        self.workers.write().await.insert(
            worker_id,
            RunningWorker {
                handler: Arc::clone(&handler),
                scope: Arc::clone(&worker_scope),
            },
        );

        info!(scope = %scope_key, worker = %worker_id, script = %script_url, "Installing service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_key.clone(),
        });
        self.set_state(&scope_key, &worker_scope, ServiceWorkerState::Installing)
            .await;

        if let Err(e) = handler.on_install(&worker_scope).await {
            warn!(scope = %scope_key, worker = %worker_id, error = %e, "Install failed");
            {
                let mut registrations = self.registrations.write().await;
                if let Some(registration) = registrations.get_mut(&scope_key) {
                    registration.install_failed(e.to_string());
                    if registration.is_empty() {
                        registrations.remove(&scope_key);
                    }
                }
            }
            self.workers.write().await.remove(&worker_id);
            self.set_state(&scope_key, &worker_scope, ServiceWorkerState::Redundant)
                .await;
            return Err(e);
        }

        let (replaced, active) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_key)
                .ok_or_else(|| AgentError::NotFound(scope_key.clone()))?;
            let replaced = registration.install_complete();
            (replaced, registration.active.as_ref().map(|w| w.id))
        };
        if let Some(old) = replaced {
            self.retire(&scope_key, old.id).await;
        }
        self.set_state(&scope_key, &worker_scope, ServiceWorkerState::Installed)
            .await;

        let should_activate = worker_scope.skip_waiting_requested()
            || match active {
                Some(active) => self.clients.read().await.controlled_by(active) == 0,
                None => true,
            };
        if should_activate {
            self.activate_locked(&scope_key).await?;
        } else {
            debug!(scope = %scope_key, worker = %worker_id, "Worker waiting");
        }

        Ok(worker_id)
    }

    /// Activate the waiting worker of a registration.
    pub async fn activate_waiting(&self, scope: &str) -> Result<(), AgentError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.activate_locked(scope).await
    }

    async fn activate_locked(&self, scope_key: &str) -> Result<(), AgentError> {
        let (new_id, replaced) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope_key)
                .ok_or_else(|| AgentError::NotFound(scope_key.to_string()))?;
            if registration.waiting.is_none() {
                return Err(AgentError::StateError(format!("no waiting worker for {}", scope_key)));
            }
            let replaced = registration.begin_activation();
            let new_id = registration
                .active
                .as_ref()
                .map(|w| w.id)
                .ok_or_else(|| AgentError::StateError(format!("activation lost worker for {}", scope_key)))?;
            (new_id, replaced)
        };

        if let Some(old) = replaced {
            let moved = self.clients.write().await.replace_controller(old.id, new_id);
            for client_id in moved {
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id: new_id,
                });
            }
            self.retire(scope_key, old.id).await;
        }

        let Some((handler, worker_scope)) = self.running(new_id).await else {
            return Err(AgentError::NotFound(new_id.to_string()));
        };
        self.set_state(scope_key, &worker_scope, ServiceWorkerState::Activating)
            .await;

        if let Err(e) = handler.on_activate(&worker_scope).await {
            warn!(scope = %scope_key, worker = %new_id, error = %e, "Activate handler failed");
        }

        if let Some(registration) = self.registrations.write().await.get_mut(scope_key) {
            registration.finish_activation();
        }
        self.set_state(scope_key, &worker_scope, ServiceWorkerState::Activated)
            .await;
        info!(scope = %scope_key, worker = %new_id, "Service worker activated");
        Ok(())
    }

    /// Unregister the registration for `scope`. Its pages become uncontrolled.
    pub async fn unregister(&self, scope: &str) -> Result<bool, AgentError> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(mut registration) = self.registrations.write().await.remove(scope) else {
            return Ok(false);
        };
        let ids: Vec<ServiceWorkerId> = [&registration.installing, &registration.waiting, &registration.active]
            .into_iter()
            .flatten()
            .map(|w| w.id)
            .collect();
        registration.unregister();

        for id in ids {
            self.clients.write().await.release(id);
            self.retire(scope, id).await;
        }
        info!(scope, "Service worker unregistered");
        Ok(true)
    }

    /// Scope of the registration serving `url`, if any.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        self.registrations
            .read()
            .await
            .iter()
            .filter(|(_, registration)| registration.matches(&url))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(scope, _)| scope.clone())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Active worker of a registration.
    pub async fn active_worker(&self, scope: &str) -> Option<(ServiceWorkerId, ServiceWorkerState)> {
        let registrations = self.registrations.read().await;
        registrations
            .get(scope)?
            .active
            .as_ref()
            .map(|w| (w.id, w.state))
    }

    /// Waiting worker of a registration.
    pub async fn waiting_worker(&self, scope: &str) -> Option<ServiceWorkerId> {
        let registrations = self.registrations.read().await;
        registrations.get(scope)?.waiting.as_ref().map(|w| w.id)
    }

    /// Open a page. It is controlled by the active worker whose scope covers it.
    pub async fn open_client(&self, url: &str) -> Result<String, AgentError> {
        let url = Url::parse(url).map_err(SwCacheError::from)?;
        let mut client = Client::window(url);
        client.controller = self.active_for(&client.url).await;
        let id = client.id.clone();
        debug!(client = %id, url = %client.url, controller = ?client.controller, "Client opened");
        self.clients.write().await.add(client);
        Ok(id)
    }

    /// Open a page and load its document through the worker.
    pub async fn navigate(&self, url: &str) -> Result<(String, Response), AgentError> {
        let client_id = self.open_client(url).await?;
        let url = Url::parse(url).map_err(SwCacheError::from)?;
        let response = self.dispatch_fetch(Some(&client_id), Request::navigate(url)).await?;
        Ok((client_id, response))
    }

    /// Close a page. A waiting worker activates once the old one has no pages left.
    pub async fn close_client(&self, client_id: &str) -> Result<(), AgentError> {
        let client = self
            .clients
            .write()
            .await
            .remove(client_id)
            .ok_or_else(|| AgentError::NotFound(client_id.to_string()))?;
        debug!(client = %client.id, "Client closed");

        let Some(controller) = client.controller else {
            return Ok(());
        };
        if self.clients.read().await.controlled_by(controller) > 0 {
            return Ok(());
        }

        let ready: Vec<String> = self
            .registrations
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.waiting.is_some() && r.active.as_ref().map(|w| w.id) == Some(controller))
            .map(|(scope, _)| scope.clone())
            .collect();
        for scope in ready {
            self.activate_waiting(&scope).await?;
        }
        Ok(())
    }

    /// Controller of a page.
    pub async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(client_id)?.controller
    }

    /// Route a request from a page.
    ///
    /// Navigations go to the active worker whose scope covers the URL; other
    /// requests go to the page's controller. Requests with no worker go
    /// straight to the network.
    pub async fn dispatch_fetch(&self, client_id: Option<&str>, request: Request) -> Result<Response, AgentError> {
        let worker = if request.is_navigation() {
            self.active_for(&request.url).await
        } else {
            match client_id {
                Some(id) => {
                    self.clients
                        .read()
                        .await
                        .get(id)
                        .ok_or_else(|| AgentError::NotFound(id.to_string()))?
                        .controller
                }
                None => None,
            }
        };

        let running = match worker {
            Some(id) => self.running(id).await,
            None => None,
        };
        let Some((handler, worker_scope)) = running else {
            debug!(url = %request.url, "No controller, fetching directly");
            return Ok(self.fetcher.fetch(&request).await?);
        };

        handler
            .on_fetch(&worker_scope, &request)
            .await?
            .ok_or_else(|| AgentError::NoResponse(request.url.to_string()))
    }

    /// Active worker whose scope covers `url`, longest scope first.
    async fn active_for(&self, url: &Url) -> Option<ServiceWorkerId> {
        self.registrations
            .read()
            .await
            .iter()
            .filter(|(_, registration)| registration.matches(url))
            .filter_map(|(scope, registration)| registration.active.as_ref().map(|w| (scope.len(), w.id)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, id)| id)
    }

    async fn running(&self, id: ServiceWorkerId) -> Option<(Arc<dyn LifecycleHandler>, Arc<WorkerScope>)> {
        self.workers
            .read()
            .await
            .get(&id)
            .map(|w| (Arc::clone(&w.handler), Arc::clone(&w.scope)))
    }

    /// Drop a replaced worker.
    async fn retire(&self, scope_key: &str, id: ServiceWorkerId) {
        if let Some(worker) = self.workers.write().await.remove(&id) {
            self.set_state(scope_key, &worker.scope, ServiceWorkerState::Redundant)
                .await;
        }
    }

    async fn set_state(&self, scope_key: &str, worker_scope: &WorkerScope, state: ServiceWorkerState) {
        worker_scope.set_state(state).await;
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope_key.to_string(),
            worker_id: worker_scope.worker_id(),
            new_state: state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use swcache_net::mock::MockFetcher;

    /// Worker that answers every fetch with a fixed body.
    #[derive(Default)]
    struct StaticWorker {
        skip_waiting: bool,
        fail_install: AtomicBool,
    }

    #[async_trait]
    impl LifecycleHandler for StaticWorker {
        async fn on_install(&self, scope: &WorkerScope) -> Result<(), AgentError> {
            if self.skip_waiting {
                scope.skip_waiting();
            }
            if self.fail_install.load(Ordering::SeqCst) {
                return Err(AgentError::StateError("boom".into()));
            }
            Ok(())
        }

        async fn on_activate(&self, scope: &WorkerScope) -> Result<(), AgentError> {
            scope.claim_clients().await.map(|_| ())
        }

        async fn on_fetch(&self, _scope: &WorkerScope, request: &Request) -> Result<Option<Response>, AgentError> {
            if request.url.path().ends_with("/empty") {
                return Ok(None);
            }
            Ok(Some(Response::new(
                request.url.clone(),
                http::StatusCode::OK,
                http::HeaderMap::new(),
                "from worker",
            )))
        }
    }

    fn container() -> (ServiceWorkerContainer, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let fetcher = MockFetcher::new().with_route("https://example.com/page", "from network");
        ServiceWorkerContainer::new(CacheStorage::in_memory(), Arc::new(fetcher))
    }

    const SCRIPT: &str = "https://example.com/sw.js";
    const SCOPE: &str = "https://example.com/";

    #[tokio::test]
    async fn test_register_activates_first_worker() {
        let (container, mut events) = container();
        let id = container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();

        assert_eq!(container.get_registrations().await, vec![SCOPE]);
        assert_eq!(
            container.active_worker(SCOPE).await,
            Some((id, ServiceWorkerState::Activated))
        );

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_first_install_leaves_no_registration() {
        let (container, _events) = container();
        let worker = StaticWorker {
            fail_install: AtomicBool::new(true),
            ..StaticWorker::default()
        };

        let err = container
            .register(SCRIPT, Arc::new(worker), RegistrationOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::StateError(_)));
        assert!(container.get_registrations().await.is_empty());
        assert!(container.get_registration("https://example.com/page").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let (container, _events) = container();
        let first = container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();

        let broken = StaticWorker::default();
        broken.fail_install.store(true, Ordering::SeqCst);
        let err = container
            .register(SCRIPT, Arc::new(broken), RegistrationOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::StateError(_)));
        assert_eq!(container.active_worker(SCOPE).await.map(|(id, _)| id), Some(first));
        assert!(container.waiting_worker(SCOPE).await.is_none());
        assert_eq!(container.get_registrations().await, vec![SCOPE]);
    }

    #[tokio::test]
    async fn test_new_worker_waits_for_controlled_pages() {
        let (container, _events) = container();
        let first = container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();
        let page = container.open_client("https://example.com/index.html").await.unwrap();
        assert_eq!(container.controller(&page).await, Some(first));

        let second = container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();
        assert_eq!(container.waiting_worker(SCOPE).await, Some(second));
        assert_eq!(container.controller(&page).await, Some(first));

        container.close_client(&page).await.unwrap();
        assert_eq!(container.active_worker(SCOPE).await.map(|(id, _)| id), Some(second));
        assert!(container.waiting_worker(SCOPE).await.is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_takes_over_pages() {
        let (container, _events) = container();
        container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();
        let page = container.open_client("https://example.com/index.html").await.unwrap();

        let eager = StaticWorker {
            skip_waiting: true,
            ..StaticWorker::default()
        };
        let second = container
            .register(SCRIPT, Arc::new(eager), RegistrationOptions::default())
            .await
            .unwrap();

        assert_eq!(container.controller(&page).await, Some(second));
    }

    #[tokio::test]
    async fn test_uncontrolled_requests_bypass_worker() {
        let (container, _events) = container();
        let page = container.open_client("https://example.com/index.html").await.unwrap();

        let request = Request::get(Url::parse("https://example.com/page").unwrap());
        let response = container.dispatch_fetch(Some(&page), request).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "from network");
    }

    #[tokio::test]
    async fn test_controlled_requests_use_worker() {
        let (container, _events) = container();
        container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();

        let (page, response) = container.navigate("https://example.com/page").await.unwrap();
        assert_eq!(response.text().await.unwrap(), "from worker");

        let request = Request::get(Url::parse("https://example.com/empty").unwrap());
        let err = container.dispatch_fetch(Some(&page), request).await.unwrap_err();
        assert!(matches!(err, AgentError::NoResponse(_)));
    }

    #[tokio::test]
    async fn test_out_of_scope_navigation_bypasses_worker() {
        let (container, _events) = container();
        let options = RegistrationOptions {
            scope: Some("https://example.com/app/".to_string()),
        };
        container
            .register(SCRIPT, Arc::new(StaticWorker::default()), options)
            .await
            .unwrap();

        let (page, response) = container.navigate("https://example.com/page").await.unwrap();
        assert_eq!(response.text().await.unwrap(), "from network");
        assert!(container.controller(&page).await.is_none());
        assert_eq!(
            container.get_registration("https://example.com/app/x").await.as_deref(),
            Some("https://example.com/app/")
        );
    }

    #[tokio::test]
    async fn test_unregister_releases_pages() {
        let (container, _events) = container();
        container
            .register(SCRIPT, Arc::new(StaticWorker::default()), RegistrationOptions::default())
            .await
            .unwrap();
        let page = container.open_client("https://example.com/").await.unwrap();

        assert!(container.unregister(SCOPE).await.unwrap());
        assert!(!container.unregister(SCOPE).await.unwrap());
        assert!(container.controller(&page).await.is_none());
        assert!(container.get_registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_is_not_found() {
        let (container, _events) = container();
        let request = Request::get(Url::parse("https://example.com/page").unwrap());
        assert!(matches!(
            container.dispatch_fetch(Some("client-missing"), request).await,
            Err(AgentError::NotFound(_))
        ));
    }
}
