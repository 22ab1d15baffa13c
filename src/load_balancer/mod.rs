//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → backend_group identified
//!     → manager.rs (group name → LoadBalancer)
//!     → balancer.rs select_target:
//!         - sticky.rs (session cookie / path parameter → route → target)
//!         - round_robin.rs (rotate through targets by availability)
//!     → pool.rs (connection for the current worker's shard.rs)
//!     → Return pooled connection or error
//! ```
//!
//! # Design Decisions
//! - The target list is an immutable snapshot swapped on change; selection never locks
//! - Availability is computed from the calling worker's shard plus the error policy
//! - Sticky traffic stays pinned unless the target is closed
//! - Connection pooling per target, partitioned per worker thread

pub mod backend;
pub mod balancer;
pub mod manager;
pub mod pool;
pub mod round_robin;
pub(crate) mod shard;
pub mod sticky;

use serde::Serialize;
use std::sync::Arc;

use crate::load_balancer::backend::Backend;
use crate::net::upstream::Connector;

pub use balancer::LoadBalancer;
pub use manager::BackendManager;
pub use pool::{ConnectionPool, PoolSettings, PoolStats, PooledConnection};
pub use round_robin::RoundRobin;

/// Whether a target can take a new request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    /// Idle connection or spare capacity on this shard.
    Available,
    /// At capacity, request would queue.
    Full,
    /// At capacity and the queue is full.
    FullQueue,
    /// Error policy reports a problem.
    Problem,
    /// Removed or shut down; can never serve.
    Closed,
    /// Only sticky traffic is accepted.
    Drain,
}

/// Strategy picking a target from a snapshot of the target list.
pub trait HostSelector<K: Connector>: Send + Sync {
    fn select(&self, backends: &[Arc<Backend<K>>]) -> Option<Arc<Backend<K>>>;
}
