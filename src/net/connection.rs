//! Downstream connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry per-connection state into every request (peer address, worker,
//!   the exclusive upstream binding)
//! - Count active connections for graceful shutdown

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::load_balancer::pool::PooledConnection;
use crate::net::upstream::{Connector, HttpConnector, UpstreamConnection};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Upstream connection bound 1:1 to a downstream connection.
///
/// Used for connection-oriented authentication schemes. The bound connection
/// is outside pool accounting and closes with the downstream connection.
pub struct ExclusiveSlot<K: Connector> {
    conn: Mutex<Option<PooledConnection<K>>>,
}

impl<K: Connector> ExclusiveSlot<K> {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    /// Take the bound connection if it is still open. A closed binding is dropped.
    pub fn take_open(&self) -> Option<PooledConnection<K>> {
        let bound = self.conn.lock().take()?;
        bound.is_open().then_some(bound)
    }

    /// Bind a connection, replacing any previous one.
    pub fn put(&self, conn: PooledConnection<K>) {
        let reusable = conn.connection().is_some_and(|c| c.is_open() && !c.is_upgraded());
        if reusable {
            let previous = self.conn.lock().replace(conn);
            drop(previous);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.conn.lock().is_some()
    }
}

impl<K: Connector> Default for ExclusiveSlot<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection context attached to every request as `ConnectInfo`.
pub struct DownstreamConnection<K: Connector = HttpConnector> {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub worker: Option<usize>,
    exclusive: Arc<ExclusiveSlot<K>>,
}

impl<K: Connector> DownstreamConnection<K> {
    pub fn new(remote_addr: SocketAddr, local_addr: Option<SocketAddr>, worker: Option<usize>) -> Self {
        Self {
            id: ConnectionId::new(),
            remote_addr,
            local_addr,
            worker,
            exclusive: Arc::new(ExclusiveSlot::new()),
        }
    }

    pub fn exclusive(&self) -> &Arc<ExclusiveSlot<K>> {
        &self.exclusive
    }
}

impl<K: Connector> Clone for DownstreamConnection<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            worker: self.worker,
            exclusive: self.exclusive.clone(),
        }
    }
}

impl<K: Connector> fmt::Debug for DownstreamConnection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Tracks active downstream connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or `limit` elapses.
    /// Returns whether every connection closed.
    pub async fn wait_for_idle(&self, limit: Duration) -> bool {
        let drained = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
