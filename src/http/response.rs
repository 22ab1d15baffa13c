//! Response streaming back to the client.
//!
//! # Responsibilities
//! - Stream the upstream body downstream without buffering
//! - Give the upstream connection back when the body completes, close it
//!   when the body fails or is abandoned
//! - Enforce the exchange deadline while streaming
//! - Map proxy failures to error responses
//!
//! # Design Decisions
//! - Hop-by-hop headers are stripped from upstream responses (except 101s)
//! - A response the client stops reading closes the upstream connection

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Instant, Sleep};

use crate::http::exchange::{ExchangeState, ExchangeTracker};
use crate::http::request::ContinueGate;
use crate::load_balancer::pool::PooledConnection;
use crate::net::connection::ExclusiveSlot;
use crate::net::upstream::Connector;

/// Where the upstream connection goes once the response is complete.
pub(crate) enum Release<K: Connector> {
    /// Back to its pool.
    Pool(PooledConnection<K>),
    /// Back to the downstream connection's exclusive binding.
    Exclusive(PooledConnection<K>, Arc<ExclusiveSlot<K>>),
    /// Closed.
    Discard(PooledConnection<K>),
}

impl<K: Connector> Release<K> {
    pub(crate) fn complete(self) {
        match self {
            Release::Pool(conn) => {
                let pool = conn.pool().clone();
                pool.return_connection(conn);
            }
            Release::Exclusive(conn, slot) => slot.put(conn),
            Release::Discard(conn) => drop(conn),
        }
    }
}

/// Upstream response body with connection bookkeeping attached.
pub(crate) struct ResponseBody<K: Connector> {
    inner: Body,
    release: Option<Release<K>>,
    deadline: Option<Pin<Box<Sleep>>>,
    tracker: Arc<ExchangeTracker>,
    // keeps an abandoned request body pending until the response is done
    _gate: Option<ContinueGate>,
}

impl<K: Connector> ResponseBody<K> {
    pub(crate) fn new(
        inner: Body,
        release: Release<K>,
        deadline: Option<Instant>,
        tracker: Arc<ExchangeTracker>,
        gate: Option<ContinueGate>,
    ) -> Self {
        Self {
            inner,
            release: Some(release),
            deadline: deadline.map(|at| Box::pin(tokio::time::sleep_until(at))),
            tracker,
            _gate: gate,
        }
    }

    fn finish(&mut self, completed: bool) {
        let Some(release) = self.release.take() else {
            return;
        };
        if completed {
            release.complete();
            self.tracker.transition(ExchangeState::Done);
        } else {
            drop(release);
            self.tracker.transition(ExchangeState::Failed);
        }
    }
}

impl<K: Connector> HttpBody for ResponseBody<K> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        if let Some(deadline) = self.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                self.deadline = None;
                self.tracker.transition(ExchangeState::TimedOut);
                self.finish(false);
                return Poll::Ready(Some(Err(axum::Error::new("exchange timed out while streaming"))));
            }
        }

        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                self.finish(true);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::debug!(error = %e, "Upstream response body failed");
                self.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<K: Connector> Drop for ResponseBody<K> {
    fn drop(&mut self) {
        let completed = self.inner.is_end_stream();
        self.finish(completed);
    }
}

/// Whether the upstream asked to close the connection after this response.
pub(crate) fn closes_connection(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Plain-text error response sent when no upstream response exists.
pub fn error_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
