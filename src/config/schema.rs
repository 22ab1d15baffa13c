//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files, and
//! every section has defaults so a minimal file is enough.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, worker threads).
    pub listener: ListenerConfig,

    /// Route definitions mapping requests to backend groups.
    pub routes: Vec<RouteConfig>,

    /// Backend target definitions.
    pub backends: Vec<BackendConfig>,

    /// Connection pool sizing, applied to every target.
    pub pool: PoolConfig,

    /// Failure accounting for every target.
    pub error_policy: ErrorPolicyConfig,

    /// Sticky session settings.
    pub sticky: StickyConfig,

    /// Request forwarding behaviour.
    pub proxy: ProxySettingsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Number of worker threads; each owns one connection shard per pool.
    pub workers: usize,

    /// Maximum concurrent downstream connections (backpressure).
    pub max_connections: usize,

    /// How long shutdown waits for in-flight connections.
    pub shutdown_grace_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            workers: num_cpus::get(),
            max_connections: 10_000,
            shutdown_grace_secs: 30,
        }
    }
}

/// Route configuration mapping requests to backend groups.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (case-insensitive, port ignored).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Backend group name to forward to.
    pub backend_group: String,

    /// Forward only the part of the path after `path_prefix`.
    #[serde(default)]
    pub strip_prefix: bool,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Backend target configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend group this target belongs to.
    pub group: String,

    /// Target base URI (e.g., "http://127.0.0.1:3000/app").
    pub uri: String,

    /// Route id embedded in sticky session ids.
    #[serde(default)]
    pub route: Option<String>,

    /// Optional domain tag.
    #[serde(default)]
    pub domain: Option<String>,
}

/// Connection pool configuration, per target and per worker thread.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Charged connections per worker thread.
    pub max_connections_per_thread: usize,

    /// Hard cap on idle connections per worker thread.
    pub max_cached_idle_connections: usize,

    /// Idle connections kept regardless of TTL.
    pub soft_max_idle_connections: usize,

    /// Idle time after which connections above the soft max are closed.
    pub idle_connection_ttl_ms: Option<u64>,

    /// Requests allowed to queue per worker thread once at capacity.
    pub max_queue_size: usize,

    /// Longest a request waits in the queue.
    pub max_queue_wait_ms: Option<u64>,

    /// Upstream TCP connect timeout.
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_thread: 10,
            max_cached_idle_connections: 10,
            soft_max_idle_connections: 5,
            idle_connection_ttl_ms: None,
            max_queue_size: 0,
            max_queue_wait_ms: None,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Error policy thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ErrorPolicyConfig {
    /// Delay before a reconnect probe once a target is in problem state.
    pub problem_server_retry_secs: u64,

    /// Failures within `error_interval_secs` that put a target in problem state.
    pub error_threshold: u32,

    /// Consecutive successes needed to recover.
    pub success_threshold: u32,

    /// Window in which failures are counted together.
    pub error_interval_secs: u64,
}

impl Default for ErrorPolicyConfig {
    fn default() -> Self {
        Self {
            problem_server_retry_secs: 10,
            error_threshold: 1,
            success_threshold: 1,
            error_interval_secs: 60,
        }
    }
}

/// Sticky session configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StickyConfig {
    /// Cookies carrying a session id with an embedded route.
    pub cookie_names: Vec<String>,

    /// Treat every route after the session id as a preference list.
    pub ranked_routing: bool,

    /// Separator between session id and route(s).
    pub routing_delimiter: String,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            cookie_names: vec!["JSESSIONID".to_string()],
            ranked_routing: false,
            routing_delimiter: ".".to_string(),
        }
    }
}

/// Forwarding behaviour of the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProxySettingsConfig {
    /// Maximum duration of one exchange.
    pub request_timeout_ms: Option<u64>,

    /// Extra connect attempts after the first one fails.
    pub max_connection_retries: u32,

    /// Replace Host with the target's authority.
    pub rewrite_host_header: bool,

    /// Append to an inbound X-Forwarded-For instead of replacing it.
    pub reuse_existing_x_forwarded_for: bool,

    /// Headers added to every outbound request; values are templates.
    pub request_headers: BTreeMap<String, String>,

    /// Authorization schemes that bind an upstream connection to the client connection.
    pub exclusive_auth_schemes: Vec<String>,
}

impl Default for ProxySettingsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: None,
            max_connection_retries: 1,
            rewrite_host_header: false,
            reuse_existing_x_forwarded_for: false,
            request_headers: BTreeMap::new(),
            exclusive_auth_schemes: vec!["NTLM".to_string(), "Negotiate".to_string()],
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
