//! Admin API.
//!
//! # Endpoints
//! - `GET    /admin/status`         process and configuration summary
//! - `GET    /admin/targets`        every group with its targets and pool stats
//! - `POST   /admin/targets`        add a target to a group
//! - `DELETE /admin/targets`        remove a target (`?group=..&uri=..`)
//! - `POST   /admin/targets/drain`  stop round-robin traffic to a target
//!
//! Every endpoint requires `Authorization: Bearer <admin.api_key>`.
//! Runtime changes are not written back to configuration; the next reload
//! brings the node list back in line with the file.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route(
            "/admin/targets",
            get(list_targets).post(add_target).delete(remove_target),
        )
        .route("/admin/targets/drain", post(drain_target))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until `stop` flips to true.
pub async fn serve(state: AppState, mut stop: watch::Receiver<bool>) {
    let address = state.config.load().admin.bind_address.clone();
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %address, error = %e, "Failed to bind admin API");
            return;
        }
    };
    tracing::info!(address = %address, "Admin API listening");

    let shutdown = async move {
        let _ = stop.wait_for(|stopped| *stopped).await;
    };
    if let Err(e) = axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Admin API failed");
    }
}
