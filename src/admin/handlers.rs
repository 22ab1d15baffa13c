use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::http::server::AppState;
use crate::load_balancer::backend::{Backend, BackendTarget};
use crate::load_balancer::{Availability, LoadBalancer, PoolStats};
use crate::net::upstream::HttpConnector;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub workers: usize,
    pub routes: usize,
    pub groups: usize,
    pub targets: usize,
}

#[derive(Debug, Serialize)]
pub struct TargetStatus {
    pub uri: String,
    pub route: Option<String>,
    pub domain: Option<String>,
    pub availability: Availability,
    pub healthy: bool,
    pub probing: bool,
    pub draining: bool,
    pub stats: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AddTarget {
    pub group: String,
    pub uri: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TargetRef {
    pub group: String,
    pub uri: String,
}

impl TargetStatus {
    fn of(backend: &Backend<HttpConnector>) -> Self {
        let target = backend.target();
        let pool = backend.pool();
        Self {
            uri: target.to_string(),
            route: target.route().map(str::to_string),
            domain: target.domain().map(str::to_string),
            availability: backend.availability(),
            healthy: pool.error_policy().is_available(),
            probing: pool.is_probing(),
            draining: pool.is_draining(),
            stats: pool.stats(),
        }
    }
}

fn group_status(name: &str, balancer: &LoadBalancer<HttpConnector>) -> GroupStatus {
    GroupStatus {
        name: name.to_string(),
        targets: balancer.targets().iter().map(|b| TargetStatus::of(b)).collect(),
    }
}

fn lookup(state: &AppState, target: &TargetRef) -> Result<(Arc<LoadBalancer<HttpConnector>>, Url), ApiError> {
    let balancer = state
        .backends
        .group(&target.group)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown group '{}'", target.group)))?;
    let uri = Url::parse(&target.uri)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid uri '{}': {e}", target.uri)))?;
    Ok((balancer, uri))
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let groups = state.backends.groups();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        workers: state.backends.shard_count(),
        routes: state.router.load().len(),
        groups: groups.len(),
        targets: groups.values().map(|g| g.targets().len()).sum(),
    })
}

pub async fn list_targets(State(state): State<AppState>) -> Json<Vec<GroupStatus>> {
    let groups = state.backends.groups();
    let mut statuses: Vec<GroupStatus> = groups
        .iter()
        .map(|(name, balancer)| group_status(name, balancer))
        .collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    Json(statuses)
}

pub async fn add_target(
    State(state): State<AppState>,
    Json(body): Json<AddTarget>,
) -> Result<(StatusCode, Json<TargetStatus>), ApiError> {
    let balancer = state
        .backends
        .group(&body.group)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown group '{}'", body.group)))?;
    let mut target = BackendTarget::parse(&body.uri)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid uri '{}': {e}", body.uri)))?;
    if target.scheme() != "http" {
        return Err(api_error(StatusCode::BAD_REQUEST, "only http targets are supported"));
    }
    if let Some(route) = body.route {
        target = target.with_route(route);
    }
    if let Some(domain) = body.domain {
        target = target.with_domain(domain);
    }

    let backend = balancer.add_target(target);
    Ok((StatusCode::CREATED, Json(TargetStatus::of(&backend))))
}

pub async fn remove_target(
    State(state): State<AppState>,
    Query(target): Query<TargetRef>,
) -> Result<StatusCode, ApiError> {
    let (balancer, uri) = lookup(&state, &target)?;
    match balancer.remove_target(&uri) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("unknown target '{}'", target.uri))),
    }
}

pub async fn drain_target(
    State(state): State<AppState>,
    Json(target): Json<TargetRef>,
) -> Result<StatusCode, ApiError> {
    let (balancer, uri) = lookup(&state, &target)?;
    if balancer.drain_target(&uri) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(StatusCode::NOT_FOUND, format!("unknown target '{}'", target.uri)))
    }
}
