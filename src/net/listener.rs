//! TCP listener shared by the worker threads, with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address once
//! - Give every worker its own accept handle on the same socket
//! - Enforce max_connections across all workers via one semaphore
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind: {0}")]
    Bind(std::io::Error),
    #[error("failed to accept: {0}")]
    Accept(std::io::Error),
    #[error("listener closed")]
    Closed,
}

/// The bound socket plus the connection limit shared by all workers.
#[derive(Debug)]
pub struct Listener {
    inner: std::net::TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let inner = std::net::TcpListener::bind(addr).map_err(ListenerError::Bind)?;
        inner.set_nonblocking(true).map_err(ListenerError::Bind)?;
        Self::from_std(inner, config.max_connections)
    }

    /// Adopt a listener bound elsewhere (tests bind port 0 themselves).
    pub fn from_tokio(listener: TcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        let inner = listener.into_std().map_err(ListenerError::Bind)?;
        Self::from_std(inner, max_connections)
    }

    fn from_std(inner: std::net::TcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        let local_addr = inner.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %local_addr, max_connections, "Listener bound");
        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Accept handle for the calling worker. Must run inside the worker's runtime.
    pub fn worker_listener(&self) -> Result<WorkerListener, ListenerError> {
        let socket = self.inner.try_clone().map_err(ListenerError::Bind)?;
        let inner = TcpListener::from_std(socket).map_err(ListenerError::Bind)?;
        Ok(WorkerListener {
            inner,
            connection_limit: self.connection_limit.clone(),
        })
    }
}

/// One worker's accept side of the shared socket.
#[derive(Debug)]
pub struct WorkerListener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
}

impl WorkerListener {
    /// Accept a new connection, respecting the connection limit.
    ///
    /// Waits while the limit is reached. The permit must be held for the
    /// connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

/// A permit representing a connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
