//! One downstream request/response pair as seen by the proxy.
//!
//! # Responsibilities
//! - Carry the inbound request together with its connection context
//!   (peer address, scheme, request id, TLS session, exclusive binding)
//! - Track the lifecycle state of the exchange
//!
//! # State Machine
//! ```text
//! Selecting → Connecting → (Retry → Connecting)* → ForwardingRequest
//!     → AwaitingResponse → StreamingResponse → Done
//!
//! any non-terminal state → TimedOut | Failed
//! ```

use axum::body::Body;
use axum::http::Request;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::net::connection::{DownstreamConnection, ExclusiveSlot};
use crate::net::upstream::{Connector, HttpConnector};

/// Lifecycle state of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeState {
    Selecting,
    Connecting { attempt: u32 },
    Retry { attempt: u32 },
    ForwardingRequest,
    AwaitingResponse,
    StreamingResponse,
    Done,
    TimedOut,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::TimedOut | Self::Failed)
    }
}

/// Shared view of an exchange's state; outlives the request once the
/// response body starts streaming.
#[derive(Debug)]
pub struct ExchangeTracker {
    history: Mutex<Vec<ExchangeState>>,
}

impl ExchangeTracker {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(vec![ExchangeState::Selecting]),
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.history
            .lock()
            .last()
            .copied()
            .unwrap_or(ExchangeState::Selecting)
    }

    /// Move to `next`. Terminal states are final; later transitions are ignored.
    pub fn transition(&self, next: ExchangeState) {
        let mut history = self.history.lock();
        if history.last().is_some_and(|state| state.is_terminal()) {
            return;
        }
        tracing::trace!(state = ?next, "Exchange state");
        history.push(next);
    }

    /// Every state visited, oldest first.
    pub fn history(&self) -> Vec<ExchangeState> {
        self.history.lock().clone()
    }
}

impl Default for ExchangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// TLS session details of the downstream connection, forwarded to the
/// upstream request as an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSessionInfo {
    pub cipher_suite: Option<String>,
    pub session_id: Option<Bytes>,
    pub peer_certificates: Vec<Bytes>,
}

/// An inbound request on its way through the proxy.
pub struct Exchange<K: Connector = HttpConnector> {
    pub request: Request<Body>,
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    /// Scheme the client used to reach the proxy.
    pub scheme: &'static str,
    /// Request path relative to the matched route; appended to the target's base path.
    pub relative_path: String,
    pub request_id: Option<String>,
    pub tls: Option<TlsSessionInfo>,
    pub exclusive: Option<Arc<ExclusiveSlot<K>>>,
    tracker: Arc<ExchangeTracker>,
}

impl<K: Connector> Exchange<K> {
    pub fn new(request: Request<Body>, remote_addr: SocketAddr) -> Self {
        let relative_path = request.uri().path().to_string();
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Self {
            request,
            remote_addr,
            local_addr: None,
            scheme: "http",
            relative_path,
            request_id,
            tls: None,
            exclusive: None,
            tracker: Arc::new(ExchangeTracker::new()),
        }
    }

    /// Take peer addresses and the exclusive binding from the downstream connection.
    pub fn with_connection(mut self, connection: &DownstreamConnection<K>) -> Self {
        self.remote_addr = connection.remote_addr;
        self.local_addr = connection.local_addr;
        self.exclusive = Some(connection.exclusive().clone());
        self
    }

    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = path.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsSessionInfo) -> Self {
        self.scheme = "https";
        self.tls = Some(tls);
        self
    }

    pub fn tracker(&self) -> &Arc<ExchangeTracker> {
        &self.tracker
    }

    pub fn state(&self) -> ExchangeState {
        self.tracker.state()
    }

    /// Host the client addressed, from the Host header or the request URI.
    pub fn host(&self) -> Option<&str> {
        self.request
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.request.uri().authority().map(|a| a.as_str()))
    }
}
