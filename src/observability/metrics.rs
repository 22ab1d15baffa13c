//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, latency, pool events, backend health)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, group
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_pool_events_total` (counter): pool events by target and event
//! - `proxy_backend_health` (gauge): 1=ok, 0=problem
//! - `proxy_retries_total` (counter): connect retries
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, group: &str, start: Instant) {
    metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "group" => group.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "group" => group.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_pool_event(target: &str, event: &'static str) {
    metrics::counter!(
        "proxy_pool_events_total",
        "target" => target.to_string(),
        "event" => event
    )
    .increment(1);
}

pub fn record_backend_health(target: &str, healthy: bool) {
    metrics::gauge!("proxy_backend_health", "target" => target.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_retry(target: &str) {
    metrics::counter!("proxy_retries_total", "target" => target.to_string()).increment(1);
}
