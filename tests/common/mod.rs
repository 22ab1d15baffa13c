//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::Request,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use lb_proxy::config::{BackendConfig, ProxyConfig, RouteConfig};
use lb_proxy::http::HttpServer;
use lb_proxy::lifecycle::Shutdown;

/// Echo backend state.
#[derive(Clone)]
pub struct MockBackend {
    pub name: &'static str,
    pub delay: Duration,
    pub hits: Arc<AtomicUsize>,
}

/// Start a backend that answers every request with a JSON description of
/// what it received.
pub async fn start_echo_backend(name: &'static str) -> (SocketAddr, MockBackend) {
    start_slow_backend(name, Duration::ZERO).await
}

/// Like [`start_echo_backend`], but waits `delay` before answering.
pub async fn start_slow_backend(name: &'static str, delay: Duration) -> (SocketAddr, MockBackend) {
    let backend = MockBackend {
        name,
        delay,
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(echo).with_state(backend.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, backend)
}

async fn echo(State(backend): State<MockBackend>, request: Request<Body>) -> Json<Value> {
    backend.hits.fetch_add(1, Ordering::SeqCst);
    if !backend.delay.is_zero() {
        tokio::time::sleep(backend.delay).await;
    }

    let mut headers = Map::new();
    for name in request.headers().keys() {
        let values: Vec<&str> = request
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        headers.insert(name.to_string(), Value::String(values.join(", ")));
    }
    let uri = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_default();

    Json(json!({
        "backend": backend.name,
        "method": request.method().as_str(),
        "uri": uri,
        "headers": headers,
    }))
}

/// Start a raw WebSocket server that echoes every message back.
pub async fn start_websocket_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn backend(name: &str, group: &str, addr: SocketAddr, route: Option<&str>) -> BackendConfig {
    BackendConfig {
        name: name.into(),
        group: group.into(),
        uri: format!("http://{addr}"),
        route: route.map(str::to_string),
        domain: None,
    }
}

pub fn route(name: &str, prefix: &str, group: &str, strip_prefix: bool) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        host: None,
        path_prefix: Some(prefix.into()),
        backend_group: group.into(),
        strip_prefix,
        priority: 0,
    }
}

/// Base configuration for tests: two workers, no admin API.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.workers = 2;
    config.listener.shutdown_grace_secs = 1;
    config.admin.enabled = false;
    config
}

/// Running proxy; shuts down when dropped.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub config_updates: mpsc::UnboundedSender<ProxyConfig>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let (config_updates, updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(config);
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, updates, server_shutdown).await;
    });

    TestProxy {
        addr,
        shutdown,
        config_updates,
    }
}

/// Client without connection reuse so every request opens a fresh
/// downstream connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
