//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router with the proxy handler and middleware
//!   (request id, tracing)
//! - Run one accept loop per worker thread over the shared listener
//! - Serve HTTP/1.1 with upgrades, attaching per-connection context
//! - Dispatch requests to routing, then to the group's load balancer
//! - Apply reloaded configuration and shut down gracefully

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tower::ServiceExt;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin;
use crate::config::ProxyConfig;
use crate::http::exchange::Exchange;
use crate::http::proxy::{ProxyOutcome, ProxySettings, ReverseProxy};
use crate::http::response::error_response;
use crate::load_balancer::manager::ReloadSummary;
use crate::load_balancer::BackendManager;
use crate::net::connection::{ConnectionTracker, DownstreamConnection};
use crate::net::listener::{Listener, ListenerError};
use crate::net::upstream::HttpConnector;
use crate::net::worker::WorkerPool;
use crate::observability::metrics;
use crate::routing::Router as ProxyRouter;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers. Every part is swapped
/// atomically on reload.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub router: Arc<ArcSwap<ProxyRouter>>,
    pub proxy: Arc<ArcSwap<ReverseProxy>>,
    pub backends: Arc<BackendManager<HttpConnector>>,
}

impl AppState {
    pub fn new(config: ProxyConfig, shard_count: usize) -> Self {
        let connector = Arc::new(HttpConnector::new(Duration::from_millis(config.pool.connect_timeout_ms)));
        let backends = Arc::new(BackendManager::new(&config, connector, shard_count));
        Self {
            router: Arc::new(ArcSwap::from_pointee(ProxyRouter::from_config(config.routes.clone()))),
            proxy: Arc::new(ArcSwap::from_pointee(ReverseProxy::new(ProxySettings::from_config(&config)))),
            config: Arc::new(ArcSwap::from_pointee(config)),
            backends,
        }
    }

    /// Swap in a new configuration. Unchanged targets keep their pools.
    pub fn apply(&self, config: ProxyConfig) -> ReloadSummary {
        self.router
            .store(Arc::new(ProxyRouter::from_config(config.routes.clone())));
        self.proxy
            .store(Arc::new(ReverseProxy::new(ProxySettings::from_config(&config))));
        let summary = self.backends.apply(&config);
        self.config.store(Arc::new(config));
        tracing::info!(
            added = summary.added,
            removed = summary.removed,
            groups = summary.groups,
            "Configuration applied"
        );
        summary
    }
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    config: ProxyConfig,
    state: AppState,
    connections: ConnectionTracker,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let workers = config.listener.workers.max(1);
        let state = AppState::new(config.clone(), workers);
        Self {
            config,
            state,
            connections: ConnectionTracker::new(),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Build the Axum router with all middleware layers.
    pub fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let listener = Arc::new(Listener::from_tokio(listener, self.config.listener.max_connections)?);
        let addr = listener.local_addr()?;
        let worker_count = self.config.listener.workers.max(1);
        let grace = Duration::from_secs(self.config.listener.shutdown_grace_secs);
        tracing::info!(address = %addr, workers = worker_count, "HTTP server starting");

        let (stop_tx, stop_rx) = watch::channel(false);
        let app = Self::build_router(self.state.clone());
        let connections = self.connections.clone();
        let workers = WorkerPool::spawn(worker_count, move |id| {
            serve_worker(
                id,
                listener.clone(),
                app.clone(),
                stop_rx.clone(),
                connections.clone(),
                grace,
            )
        })?;

        let admin = self
            .config
            .admin
            .enabled
            .then(|| tokio::spawn(admin::serve(self.state.clone(), stop_tx.subscribe())));

        loop {
            tokio::select! {
                Some(config) = config_updates.recv() => {
                    self.state.apply(config);
                }
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(active = self.connections.active_count(), "Shutting down, draining connections");
        let _ = stop_tx.send(true);
        if tokio::task::spawn_blocking(move || workers.join()).await.is_err() {
            tracing::error!("Failed to join worker threads");
        }
        if let Some(admin) = admin {
            if let Err(e) = admin.await {
                tracing::error!(error = %e, "Admin server task failed");
            }
        }
        self.state.backends.close();

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// One worker's accept loop. Returns once stopped and its connections have
/// drained (or the grace period ran out).
async fn serve_worker(
    id: usize,
    listener: Arc<Listener>,
    app: Router,
    mut stop: watch::Receiver<bool>,
    connections: ConnectionTracker,
    grace: Duration,
) {
    let acceptor = match listener.worker_listener() {
        Ok(acceptor) => acceptor,
        Err(e) => {
            tracing::error!(worker = id, error = %e, "Worker could not attach to listener");
            return;
        }
    };
    let local_addr = acceptor.local_addr().ok();

    loop {
        let accepted = tokio::select! {
            accepted = acceptor.accept() => accepted,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };
        let (stream, remote_addr, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(worker = id, error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let downstream = DownstreamConnection::<HttpConnector>::new(remote_addr, local_addr, Some(id));
        let guard = connections.track(downstream.id);
        let app = app.clone();
        let mut stop = stop.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            let connection_id = downstream.id;
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                let mut request = request.map(Body::new);
                request.extensions_mut().insert(ConnectInfo(downstream.clone()));
                app.clone().oneshot(request)
            });

            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(conn);

            let finished = tokio::select! {
                result = conn.as_mut() => Some(result),
                _ = stop.wait_for(|stopped| *stopped) => None,
            };
            let result = match finished {
                Some(result) => result,
                None => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
            }
        });
    }

    if !connections.wait_for_idle(grace).await {
        tracing::warn!(
            worker = id,
            remaining = connections.active_count(),
            "Grace period elapsed with connections still open"
        );
    }
}

/// Main proxy handler.
/// Looks up the route, hands the exchange to the group's load balancer.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(downstream): ConnectInfo<DownstreamConnection>,
    request: Request<Body>,
) -> Response {
    let start_time = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()));

    let router = state.router.load();
    let Some(matched) = router.match_request(host.as_deref(), &path) else {
        tracing::debug!(path = %path, host = ?host, "No route matched");
        metrics::record_request(&method, 404, "none", start_time);
        return error_response(StatusCode::NOT_FOUND, "No matching route found");
    };
    let group = matched.route.backend_group.clone();
    let relative_path = matched.relative_path.to_string();
    drop(router);

    let Some(balancer) = state.backends.group(&group) else {
        tracing::warn!(group = %group, "Route points at an unknown backend group");
        metrics::record_request(&method, 503, &group, start_time);
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No backend available");
    };

    let exchange = Exchange::new(request, downstream.remote_addr)
        .with_connection(&downstream)
        .with_relative_path(relative_path);
    tracing::debug!(
        request_id = exchange.request_id.as_deref().unwrap_or("unknown"),
        method = %method,
        path = %path,
        group = %group,
        "Proxying request"
    );

    let proxy = state.proxy.load_full();
    let response = match proxy.handle(&balancer, exchange).await {
        ProxyOutcome::Response(response) => response,
        ProxyOutcome::NotHandled(_) => {
            tracing::warn!(group = %group, "No target available in group");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "No backend available")
        }
    };
    metrics::record_request(&method, response.status().as_u16(), &group, start_time);
    response
}
