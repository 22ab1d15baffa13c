//! Error taxonomy shared by the connection pool and the proxy orchestrator.
//!
//! Every failure is resolved inside the proxy into one of three terminal
//! outcomes: a 503, a 500, or an abrupt close of the downstream connection.

use axum::http::StatusCode;

/// Outcome of a failed [`ConnectionPool::connect`](crate::load_balancer::pool::ConnectionPool::connect).
///
/// Exactly one of these is delivered per connect request.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Opening the upstream transport failed. Fed to the error policy.
    #[error("failed to connect to backend: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The shard was at capacity and its wait queue was full.
    /// Backpressure, not a health signal.
    #[error("connection queue is full")]
    QueueRejected,

    /// A queued request waited past its deadline.
    #[error("timed out waiting for a pooled connection")]
    Timeout,

    /// The backend went into problem state while the request was queued;
    /// the caller should pick another backend.
    #[error("queued request redistributed after backend failure")]
    Redistributed,

    /// The pool was closed.
    #[error("connection pool is closed")]
    Closed,
}

/// Errors raised while talking to an upstream over an established connection.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream protocol error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of one proxied exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The load balancer found nothing usable.
    #[error("no backend available")]
    NoTargetAvailable,

    /// Retries exhausted on connect failures.
    #[error("could not obtain a backend connection: {0}")]
    ConnectFailure(#[source] PoolError),

    /// Retries exhausted and the final attempt was rejected by a full queue.
    #[error("backend queue is full")]
    QueueRejected,

    /// Waiter deadline or exchange deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The outbound request could not be built.
    #[error("invalid outbound request: {0}")]
    InvalidRequest(String),

    /// Copying bytes failed after the connection was handed over.
    #[error("streaming failed: {0}")]
    StreamingIo(#[source] ForwardError),
}

impl ProxyError {
    /// Status sent downstream when no response has started yet.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::StreamingIo(_) | ProxyError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::QueueRejected => ProxyError::QueueRejected,
            PoolError::Timeout => ProxyError::Timeout,
            other => ProxyError::ConnectFailure(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::NoTargetAvailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::from(PoolError::QueueRejected).status(), StatusCode::SERVICE_UNAVAILABLE);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset");
        assert_eq!(
            ProxyError::StreamingIo(ForwardError::Io(io)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn pool_errors_keep_their_kind() {
        assert!(matches!(ProxyError::from(PoolError::Timeout), ProxyError::Timeout));
        assert!(matches!(
            ProxyError::from(PoolError::Closed),
            ProxyError::ConnectFailure(PoolError::Closed)
        ));
    }
}
