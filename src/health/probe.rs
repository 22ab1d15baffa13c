//! Recovery probing for backends in problem state.
//!
//! # Responsibilities
//! - Periodically retry a connection to a failed backend
//! - Feed the outcome into the error policy
//! - Keep the first successful connection warm in the pool
//!
//! # Design Decisions
//! - At most one probe loop per pool (guarded by the pool's `probing` flag)
//! - The loop holds only a weak handle and ends when the pool is dropped or closed

use std::time::Duration;

use crate::load_balancer::pool::WeakPool;
use crate::net::upstream::Connector;

/// Probe loop: sleep, try to connect, repeat until the backend recovers.
pub(crate) async fn recover<K: Connector>(weak: WeakPool<K>, shard: usize, retry: Duration) {
    loop {
        tokio::time::sleep(retry).await;

        let Some(pool) = weak.upgrade() else {
            return;
        };
        if pool.is_closed() {
            pool.probe_finished();
            return;
        }

        let target = pool.target().clone();
        match pool.connector().connect(&target).await {
            Ok(conn) => {
                pool.error_policy().clear_error();
                tracing::info!(target = %target, "Reconnect probe succeeded");
                pool.adopt_warm(shard, conn);
            }
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "Reconnect probe failed");
                pool.error_policy().handle_error();
            }
        }

        if pool.error_policy().is_available() {
            pool.probe_finished();
            return;
        }
    }
}
