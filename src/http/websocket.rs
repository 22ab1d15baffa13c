//! Protocol upgrade tunnelling (WebSocket and any other `101` switch).
//!
//! # Responsibilities
//! - Wait for both sides of a `101 Switching Protocols` to hand over their
//!   raw connections
//! - Pipe bytes in both directions until either side closes
//!
//! # Data Flow
//! ```text
//! Client ←──── raw bytes ────→ Proxy ←──── raw bytes ────→ Backend
//! ```
//!
//! # Design Decisions
//! - Byte-level forwarding; frames are never parsed
//! - The upstream connection has already left its pool when the tunnel starts
//! - An error on either pipe closes both connections

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::sync::Arc;

use crate::http::exchange::{ExchangeState, ExchangeTracker};

/// Run the tunnel on the current runtime. `upstream_handle` is the detached
/// client connection; it lives as long as the tunnel.
pub(crate) fn spawn_tunnel<H: Send + 'static>(
    downstream: OnUpgrade,
    upstream: OnUpgrade,
    upstream_handle: H,
    target: String,
    tracker: Arc<ExchangeTracker>,
) {
    tokio::spawn(async move {
        let result = tunnel(downstream, upstream).await;
        drop(upstream_handle);
        match result {
            Ok((to_upstream, to_downstream)) => {
                tracing::debug!(target = %target, to_upstream, to_downstream, "Upgraded connection closed");
                tracker.transition(ExchangeState::Done);
            }
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "Upgraded connection failed");
                tracker.transition(ExchangeState::Failed);
            }
        }
    });
}

async fn tunnel(downstream: OnUpgrade, upstream: OnUpgrade) -> std::io::Result<(u64, u64)> {
    let (downstream, upstream) = tokio::try_join!(downstream, upstream).map_err(std::io::Error::other)?;
    let mut downstream = TokioIo::new(downstream);
    let mut upstream = TokioIo::new(upstream);
    tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await
}
