//! Reverse proxy orchestration for one exchange.
//!
//! # Responsibilities
//! - Select a target, obtain a connection, retry connect failures on other targets
//! - Forward the request and stream the response back
//! - Bind upstream connections to the client connection for
//!   connection-oriented authentication
//! - Enforce the exchange deadline across every phase
//!
//! # Data Flow
//! ```text
//! Exchange
//!     → exclusive binding for one of our targets, ready? → use it
//!     → LoadBalancer::select_target                   → none: NotHandled
//!     → pool.connect (queue wait capped by deadline)  → failure: retry / 503
//!     → build outbound request, send                  → failure: 500, timeout: 503
//!     → 101?                                          → detach, tunnel
//!     → stream body, then return / close connection
//! ```
//!
//! # Design Decisions
//! - Retries only happen before any byte reaches an upstream
//! - A pooled connection that turns out stale is retried but never counts
//!   against the backend's error policy

use axum::body::Body;
use axum::http::{header, HeaderMap, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::error::{PoolError, ProxyError};
use crate::http::exchange::{Exchange, ExchangeState, ExchangeTracker};
use crate::http::request::{
    build_outbound, expects_continue, is_upgrade_request, strip_hop_by_hop, ContinueGate,
    ForwardContext, GateState, RequestRewrite,
};
use crate::http::response::{closes_connection, error_response, Release, ResponseBody};
use crate::http::websocket;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::pool::PooledConnection;
use crate::load_balancer::LoadBalancer;
use crate::net::connection::ExclusiveSlot;
use crate::net::upstream::{Connector, HttpConnector, UpstreamConnection};
use crate::observability::metrics;
use crate::resilience::{ConnectAttempts, Deadline};

/// Per-exchange forwarding behaviour.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub request_timeout: Option<Duration>,
    pub max_retries: u32,
    pub max_queue_wait: Option<Duration>,
    pub exclusive_auth_schemes: Vec<String>,
    pub rewrite: RequestRewrite,
}

impl ProxySettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let proxy = &config.proxy;
        Self {
            request_timeout: proxy.request_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            max_retries: proxy.max_connection_retries,
            max_queue_wait: config.pool.max_queue_wait_ms.map(Duration::from_millis),
            exclusive_auth_schemes: proxy.exclusive_auth_schemes.clone(),
            rewrite: RequestRewrite::from_config(proxy),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Result of offering an exchange to the proxy.
pub enum ProxyOutcome<K: Connector = HttpConnector> {
    Response(Response<Body>),
    /// No target could be selected; the exchange is handed back untouched.
    NotHandled(Box<Exchange<K>>),
}

#[derive(Debug, Clone, Default)]
pub struct ReverseProxy {
    settings: ProxySettings,
}

impl ReverseProxy {
    pub fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Whether the request's Authorization scheme needs a dedicated connection.
    fn requires_exclusive(&self, headers: &HeaderMap) -> bool {
        let scheme = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split_whitespace().next());
        scheme.is_some_and(|scheme| {
            self.settings
                .exclusive_auth_schemes
                .iter()
                .any(|s| s.eq_ignore_ascii_case(scheme))
        })
    }

    pub async fn handle<K: Connector>(&self, balancer: &LoadBalancer<K>, exchange: Exchange<K>) -> ProxyOutcome<K> {
        let tracker = exchange.tracker().clone();
        let deadline = Deadline::after(self.settings.request_timeout);

        if let Some(slot) = exchange.exclusive.clone() {
            if let Some(bound) = self.take_bound(balancer, &slot, deadline).await {
                tracing::trace!(target = %bound.target(), "Reusing exclusive connection");
                return ProxyOutcome::Response(self.forward(exchange, bound, deadline).await);
            }
        }

        let headers = exchange.request.headers();
        let path = exchange.request.uri().path();
        let Some(mut backend) = balancer.select_target(headers, path) else {
            tracing::debug!(path = %path, "No target available");
            return ProxyOutcome::NotHandled(Box::new(exchange));
        };

        let exclusive = self.requires_exclusive(headers);
        let mut attempts = ConnectAttempts::new(self.settings.max_retries, deadline);
        let conn = loop {
            tracker.transition(ExchangeState::Connecting {
                attempt: attempts.attempt(),
            });
            let err = match self.acquire(&backend, exclusive, deadline).await {
                Ok(conn) => break conn,
                Err(err) => err,
            };

            tracing::debug!(
                target = %backend.target(),
                attempt = attempts.attempt(),
                error = %err,
                "Connect attempt failed"
            );
            if !attempts.retry() {
                return ProxyOutcome::Response(fail(&tracker, deadline, &err));
            }
            tracker.transition(ExchangeState::Retry {
                attempt: attempts.attempt(),
            });
            metrics::record_retry(&backend.target().to_string());
            match balancer.select_target(exchange.request.headers(), exchange.request.uri().path()) {
                Some(next) => backend = next,
                None => return ProxyOutcome::Response(fail(&tracker, deadline, &ProxyError::NoTargetAvailable)),
            }
        };

        ProxyOutcome::Response(self.forward(exchange, conn, deadline).await)
    }

    /// The connection bound to this client connection, when it belongs to one
    /// of `balancer`'s targets and is still usable.
    ///
    /// A binding owned by another group stays in the slot.
    async fn take_bound<K: Connector>(
        &self,
        balancer: &LoadBalancer<K>,
        slot: &ExclusiveSlot<K>,
        deadline: Deadline,
    ) -> Option<PooledConnection<K>> {
        let mut bound = slot.take_open()?;
        let owned = balancer
            .find(bound.target().uri())
            .is_some_and(|backend| backend.pool().ptr_eq(bound.pool()));
        if !owned {
            tracing::debug!(target = %bound.target(), "Exclusive connection is bound to another group");
            slot.put(bound);
            return None;
        }

        let upstream = bound.connection_mut()?;
        match deadline.run(upstream.ready()).await {
            Ok(Ok(())) => Some(bound),
            Ok(Err(e)) => {
                tracing::debug!(target = %bound.target(), error = %e, "Exclusive connection is stale");
                None
            }
            Err(_) => None,
        }
    }

    async fn acquire<K: Connector>(
        &self,
        backend: &Backend<K>,
        exclusive: bool,
        deadline: Deadline,
    ) -> Result<PooledConnection<K>, ProxyError> {
        let wait = deadline.cap(self.settings.max_queue_wait);
        let mut conn = deadline
            .run(backend.pool().connect(exclusive, wait))
            .await
            .map_err(|_| ProxyError::Timeout)??;

        let reused = conn.is_reused();
        if let Some(upstream) = conn.connection_mut() {
            match deadline.run(upstream.ready()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(target = %backend.target(), reused, error = %e, "Pooled connection is stale");
                    return Err(ProxyError::ConnectFailure(PoolError::ConnectFailed(std::io::Error::other(e))));
                }
                Err(_) => return Err(ProxyError::Timeout),
            }
        }
        Ok(conn)
    }

    async fn forward<K: Connector>(
        &self,
        exchange: Exchange<K>,
        mut conn: PooledConnection<K>,
        deadline: Deadline,
    ) -> Response<Body> {
        let tracker = exchange.tracker().clone();
        tracker.transition(ExchangeState::ForwardingRequest);
        let target = conn.target().clone();
        let Exchange {
            request,
            remote_addr,
            local_addr,
            scheme,
            relative_path,
            request_id,
            tls,
            exclusive,
            ..
        } = exchange;

        let (mut parts, body) = request.into_parts();
        let downstream_upgrade = if is_upgrade_request(&parts.headers) {
            parts.extensions.remove::<OnUpgrade>()
        } else {
            None
        };
        let gate = expects_continue(&parts.headers).then(ContinueGate::new);
        let ctx = ForwardContext {
            remote_addr,
            local_port: local_addr.map(|addr| addr.port()),
            scheme,
            relative_path: &relative_path,
            request_id: request_id.as_deref(),
            tls: tls.as_ref(),
        };
        let outbound = match build_outbound(&parts, body, &target, &ctx, &self.settings.rewrite, gate.as_ref()) {
            Ok(outbound) => outbound,
            Err(err) => {
                release_for(conn, exclusive, true).complete();
                return fail(&tracker, deadline, &err);
            }
        };

        tracker.transition(ExchangeState::AwaitingResponse);
        let Some(upstream) = conn.connection_mut() else {
            return fail(&tracker, deadline, &ProxyError::ConnectFailure(PoolError::Closed));
        };
        let response = match deadline.run(upstream.send_request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                drop(conn);
                return fail(&tracker, deadline, &ProxyError::StreamingIo(e));
            }
            Err(_) => {
                tracing::warn!(target = %target, "Exchange timed out waiting for the upstream response");
                drop(conn);
                return fail(&tracker, deadline, &ProxyError::Timeout);
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return switch_protocols(conn, response, downstream_upgrade, &tracker);
        }

        if let Some(gate) = &gate {
            gate.abandon();
        }
        let abandoned = gate.as_ref().is_some_and(|g| g.state() == GateState::Abandoned);
        let reusable = !abandoned && !closes_connection(response.headers());

        tracker.transition(ExchangeState::StreamingResponse);
        let (mut head, body) = response.into_parts();
        strip_hop_by_hop(&mut head.headers, false);
        let release = release_for(conn, exclusive, reusable);
        let body = ResponseBody::new(body, release, deadline.instant(), tracker, gate);
        Response::from_parts(head, Body::new(body))
    }
}

fn release_for<K: Connector>(
    conn: PooledConnection<K>,
    slot: Option<Arc<ExclusiveSlot<K>>>,
    reusable: bool,
) -> Release<K> {
    if !reusable {
        return Release::Discard(conn);
    }
    match (conn.is_exclusive(), slot) {
        (true, Some(slot)) => Release::Exclusive(conn, slot),
        (true, None) => Release::Discard(conn),
        (false, _) => Release::Pool(conn),
    }
}

/// Hand a `101` over to the tunnel. The connection leaves its pool.
fn switch_protocols<K: Connector>(
    conn: PooledConnection<K>,
    mut response: Response<Body>,
    downstream: Option<OnUpgrade>,
    tracker: &Arc<ExchangeTracker>,
) -> Response<Body> {
    let target = conn.target().to_string();
    let upstream = hyper::upgrade::on(&mut response);
    let handle = conn.detach();
    tracker.transition(ExchangeState::StreamingResponse);
    match downstream {
        Some(downstream) => websocket::spawn_tunnel(downstream, upstream, handle, target, tracker.clone()),
        None => {
            tracing::warn!(target = %target, "Upstream switched protocols on a connection that cannot upgrade");
            tracker.transition(ExchangeState::Failed);
        }
    }
    let (head, _) = response.into_parts();
    Response::from_parts(head, Body::empty())
}

fn fail(tracker: &ExchangeTracker, deadline: Deadline, err: &ProxyError) -> Response<Body> {
    let timed_out = matches!(err, ProxyError::Timeout) || deadline.is_expired();
    tracker.transition(if timed_out {
        ExchangeState::TimedOut
    } else {
        ExchangeState::Failed
    });
    tracing::warn!(error = %err, timed_out, "Proxy exchange failed");
    let status = err.status();
    error_response(status, status.canonical_reason().unwrap_or("Error"))
}
