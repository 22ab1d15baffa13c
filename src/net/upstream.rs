//! Upstream transport factory.
//!
//! # Responsibilities
//! - Define the seam the connection pool opens connections through
//! - Provide the HTTP/1.1 implementation over TCP (hyper client connections)
//!
//! # Design Decisions
//! - One upstream connection carries one exchange at a time
//! - Upgrades are enabled on every connection; a 101 hands the raw socket to
//!   the tunnel and the connection leaves the pool
//! - TLS to upstreams is not handled here; `https` targets are rejected

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::ForwardError;
use crate::http::request::WeakContinueGate;
use crate::load_balancer::backend::BackendTarget;

/// Opens connections to backend targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: UpstreamConnection;

    async fn connect(&self, target: &BackendTarget) -> io::Result<Self::Connection>;
}

/// A live connection to one upstream.
#[async_trait]
pub trait UpstreamConnection: Send + Unpin + 'static {
    /// Whether the transport can still carry a request.
    fn is_open(&self) -> bool;

    /// Whether the connection switched protocols and can no longer be pooled.
    fn is_upgraded(&self) -> bool {
        false
    }

    /// Wait until the connection can accept the next request.
    async fn ready(&mut self) -> Result<(), ForwardError>;

    /// Send one request and wait for the response head.
    async fn send_request(&mut self, request: Request<Body>) -> Result<Response<Body>, ForwardError>;
}

/// Plain-TCP HTTP/1.1 connector.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Connection = HttpConnection;

    async fn connect(&self, target: &BackendTarget) -> io::Result<HttpConnection> {
        if target.scheme() != "http" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported upstream scheme: {}", target.scheme()),
            ));
        }

        let authority = target.authority();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(io::Error::other)?;

        let peer = authority.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                tracing::debug!(peer = %peer, error = %e, "Upstream connection ended with error");
            }
        });

        tracing::trace!(peer = %authority, "Upstream connection established");
        Ok(HttpConnection { sender })
    }
}

/// A hyper HTTP/1.1 client connection.
pub struct HttpConnection {
    sender: http1::SendRequest<Body>,
}

#[async_trait]
impl UpstreamConnection for HttpConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn ready(&mut self) -> Result<(), ForwardError> {
        self.sender.ready().await.map_err(ForwardError::from)
    }

    async fn send_request(&mut self, mut request: Request<Body>) -> Result<Response<Body>, ForwardError> {
        if let Some(gate) = request.extensions_mut().remove::<WeakContinueGate>() {
            hyper::ext::on_informational(&mut request, move |response| {
                if response.status() == StatusCode::CONTINUE {
                    gate.open();
                }
            });
        }
        let response = self.sender.send_request(request).await?;
        Ok(response.map(Body::new))
    }
}
