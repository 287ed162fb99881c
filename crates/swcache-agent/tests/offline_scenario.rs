//! End-to-end tests for the offline cache agent running under the container.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use swcache_agent::{
    AgentError, OfflineCacheAgent, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerState,
};
use swcache_net::mock::MockFetcher;
use swcache_net::{Fetcher, NetError, Request, Response};
use swcache_store::CacheStorage;
use tokio::sync::mpsc;
use url::Url;

const ORIGIN: &str = "http://localhost:8501/";
const SCRIPT: &str = "http://localhost:8501/sw.js";
const CURRENT: &str = "money-app-v99";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn agent(assets: &[&str]) -> Arc<OfflineCacheAgent> {
    Arc::new(OfflineCacheAgent::with_assets(
        CURRENT,
        assets.iter().map(|a| url(a)).collect(),
    ))
}

fn network() -> Arc<MockFetcher> {
    Arc::new(
        MockFetcher::new()
            .with_typed_route("http://localhost:8501/", "text/html", "<h1>home</h1>")
            .with_typed_route("http://localhost:8501/index.html", "text/html", "<h1>index</h1>")
            .with_typed_route("http://localhost:8501/logo.png", "image/png", &b"\x89PNG"[..]),
    )
}

async fn host(
    fetcher: Arc<MockFetcher>,
    caches: CacheStorage,
    assets: &[&str],
) -> (ServiceWorkerContainer, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    let (container, events) = ServiceWorkerContainer::new(caches, fetcher);
    container
        .register(SCRIPT, agent(assets), RegistrationOptions::default())
        .await
        .unwrap();
    (container, events)
}

#[tokio::test]
async fn scenario_install_activate_and_fill() {
    init_tracing();
    let fetcher = network();
    let caches = CacheStorage::in_memory();
    caches.open("money-app-v1").await.unwrap();

    let (container, mut events) = ServiceWorkerContainer::new(caches.clone(), fetcher.clone());
    let page = container.open_client("http://localhost:8501/index.html").await.unwrap();
    assert!(container.controller(&page).await.is_none());

    let worker = container
        .register(SCRIPT, agent(&["./", "./index.html"]), RegistrationOptions::default())
        .await
        .unwrap();

    // Install filled the bucket, activate dropped the stale one and claimed the page.
    assert_eq!(caches.keys().await.unwrap(), vec![CURRENT]);
    let bucket = caches.open(CURRENT).await.unwrap();
    assert_eq!(bucket.len().await.unwrap(), 2);
    assert_eq!(container.controller(&page).await, Some(worker));

    let mut claimed = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (ServiceWorkerEvent::ControllerChange {
                client_id: page.clone(),
                worker_id: worker,
            })
        {
            claimed = true;
        }
    }
    assert!(claimed);

    // Miss: one network call, then stored.
    let logo = Request::get(url("./logo.png"));
    let response = container.dispatch_fetch(Some(&page), logo.clone()).await.unwrap();
    assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"\x89PNG"));
    assert_eq!(fetcher.calls_for("http://localhost:8501/logo.png").await, 1);
    assert_eq!(bucket.len().await.unwrap(), 3);

    // Hit: no further network calls.
    let response = container.dispatch_fetch(Some(&page), logo).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(fetcher.calls_for("http://localhost:8501/logo.png").await, 1);
}

#[tokio::test]
async fn bucket_singularity_after_activation() {
    let caches = CacheStorage::in_memory();
    for name in ["money-app-v1", "money-app-v98", "unrelated"] {
        caches.open(name).await.unwrap();
    }

    let (container, _events) = host(network(), caches.clone(), &["./"]).await;

    assert_eq!(caches.keys().await.unwrap(), vec![CURRENT]);
    assert_eq!(
        container.active_worker(ORIGIN).await.map(|(_, state)| state),
        Some(ServiceWorkerState::Activated)
    );
}

#[tokio::test]
async fn install_caches_every_asset() {
    let caches = CacheStorage::in_memory();
    let assets = ["./", "./index.html", "./logo.png"];
    let (_container, _events) = host(network(), caches.clone(), &assets).await;

    let bucket = caches.open(CURRENT).await.unwrap();
    for asset in assets {
        let hit = bucket.match_request(&Request::get(url(asset))).await.unwrap();
        assert!(hit.is_some(), "{} not cached", asset);
    }
}

#[tokio::test]
async fn install_failure_is_fatal() {
    let caches = CacheStorage::in_memory();
    let (container, mut events) = ServiceWorkerContainer::new(caches.clone(), network());

    let err = container
        .register(SCRIPT, agent(&["./", "./investimentos.html"]), RegistrationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::InstallFailed(_)));
    assert!(container.active_worker(ORIGIN).await.is_none());
    assert!(container.get_registrations().await.is_empty());
    assert!(caches.open(CURRENT).await.unwrap().is_empty().await.unwrap());

    let mut last_state = None;
    while let Ok(event) = events.try_recv() {
        if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
            last_state = Some(new_state);
        }
    }
    assert_eq!(last_state, Some(ServiceWorkerState::Redundant));
}

#[tokio::test]
async fn navigation_returns_fresh_network_copy() {
    let fetcher = network();
    let caches = CacheStorage::in_memory();
    let (container, _events) = host(fetcher.clone(), caches.clone(), &["./index.html"]).await;

    fetcher
        .set_route("http://localhost:8501/index.html", "<h1>index v2</h1>")
        .await;
    let (_page, response) = container.navigate("http://localhost:8501/index.html").await.unwrap();
    let live = response.bytes().await.unwrap();
    assert_eq!(live, Bytes::from_static(b"<h1>index v2</h1>"));

    let cached = caches
        .match_request(&Request::get(url("./index.html")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.bytes().await.unwrap(), live);
}

#[tokio::test]
async fn navigation_falls_back_to_cache_offline() {
    let fetcher = network();
    let (container, _events) = host(fetcher.clone(), CacheStorage::in_memory(), &["./"]).await;

    fetcher.set_offline(true);
    let (_page, response) = container.navigate("http://localhost:8501/").await.unwrap();
    assert_eq!(response.text().await.unwrap(), "<h1>home</h1>");
}

#[tokio::test]
async fn navigation_offline_and_uncached_is_no_response() {
    let fetcher = network();
    let (container, _events) = host(fetcher.clone(), CacheStorage::in_memory(), &["./"]).await;

    fetcher.set_offline(true);
    let err = container
        .navigate("http://localhost:8501/investimentos.html")
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NoResponse(_)));
}

#[tokio::test]
async fn subresource_hit_skips_network() {
    let fetcher = network();
    let (container, _events) = host(fetcher.clone(), CacheStorage::in_memory(), &["./logo.png"]).await;
    let page = container.open_client(ORIGIN).await.unwrap();
    let before = fetcher.calls();

    fetcher.set_offline(true);
    let response = container
        .dispatch_fetch(Some(&page), Request::get(url("./logo.png")))
        .await
        .unwrap();

    assert_eq!(response.content_type(), Some(mime::IMAGE_PNG));
    assert_eq!(fetcher.calls(), before);
}

#[tokio::test]
async fn subresource_miss_offline_fails() {
    let fetcher = network();
    let (container, _events) = host(fetcher.clone(), CacheStorage::in_memory(), &["./"]).await;
    let page = container.open_client(ORIGIN).await.unwrap();

    fetcher.set_offline(true);
    let err = container
        .dispatch_fetch(Some(&page), Request::get(url("./logo.png")))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Network(_)));
}

#[tokio::test]
async fn fragment_is_ignored_for_lookup() {
    let fetcher = network();
    let (container, _events) = host(fetcher.clone(), CacheStorage::in_memory(), &["./index.html"]).await;
    let page = container.open_client(ORIGIN).await.unwrap();
    let before = fetcher.calls();

    let response = container
        .dispatch_fetch(Some(&page), Request::get(url("./index.html#top")))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "<h1>index</h1>");
    assert_eq!(fetcher.calls(), before);
}

/// Network that streams every body in small chunks.
struct ChunkedNetwork;

#[async_trait]
impl Fetcher for ChunkedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let (tx, rx) = mpsc::channel(4);
        for chunk in ["chunk-1;", "chunk-2;", "chunk-3"] {
            tx.try_send(Ok(Bytes::from_static(chunk.as_bytes())))
                .map_err(|e| NetError::BodyStream(e.to_string()))?;
        }
        Ok(Response::from_stream(
            request.url.clone(),
            StatusCode::OK,
            HeaderMap::new(),
            rx,
        ))
    }
}

#[tokio::test]
async fn streamed_body_reaches_page_and_cache() {
    let caches = CacheStorage::in_memory();
    let (container, _events) = ServiceWorkerContainer::new(caches.clone(), Arc::new(ChunkedNetwork));
    container
        .register(SCRIPT, agent(&[]), RegistrationOptions::default())
        .await
        .unwrap();
    let page = container.open_client(ORIGIN).await.unwrap();

    let request = Request::get(url("./app.js"));
    let response = container.dispatch_fetch(Some(&page), request.clone()).await.unwrap();
    assert!(!response.is_streaming());
    assert_eq!(response.text().await.unwrap(), "chunk-1;chunk-2;chunk-3");

    let cached = caches.match_request(&request).await.unwrap().unwrap();
    assert_eq!(cached.text().await.unwrap(), "chunk-1;chunk-2;chunk-3");
}

#[tokio::test]
async fn concurrent_fills_last_write_wins() {
    let fetcher = network();
    let caches = CacheStorage::in_memory();
    let (container, _events) = host(fetcher.clone(), caches.clone(), &[]).await;
    let page = container.open_client(ORIGIN).await.unwrap();

    let request = Request::get(url("./logo.png"));
    let (a, b) = tokio::join!(
        container.dispatch_fetch(Some(&page), request.clone()),
        container.dispatch_fetch(Some(&page), request.clone()),
    );
    assert!(a.is_ok() && b.is_ok());

    let bucket = caches.open(CURRENT).await.unwrap();
    assert_eq!(bucket.keys().await.unwrap(), vec!["http://localhost:8501/logo.png"]);
}
