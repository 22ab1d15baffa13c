//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing backend groups)
//! - Validate value ranges (thresholds, worker counts, pool sizes)
//! - Detect ambiguous sticky routes
//! - Reject injected headers with invalid names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("backend '{name}': invalid uri '{uri}'")]
    InvalidUri { name: String, uri: String },

    #[error("backend '{name}': unsupported scheme '{scheme}'")]
    UnsupportedScheme { name: String, scheme: String },

    #[error("group '{group}': route '{route}' is used by more than one backend")]
    DuplicateRoute { group: String, route: String },

    #[error("route '{route}': unknown backend group '{group}'")]
    UnknownGroup { route: String, group: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("pool.soft_max_idle_connections ({soft}) exceeds pool.max_cached_idle_connections ({cached})")]
    SoftMaxAboveCached { soft: usize, cached: usize },

    #[error("sticky.routing_delimiter must not be empty")]
    EmptyDelimiter,

    #[error("proxy.request_headers: invalid header name '{0}'")]
    InvalidHeaderName(String),
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.workers == 0 {
        errors.push(ValidationError::Zero { field: "listener.workers" });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero {
            field: "listener.max_connections",
        });
    }
    if config.pool.max_connections_per_thread == 0 {
        errors.push(ValidationError::Zero {
            field: "pool.max_connections_per_thread",
        });
    }
    if config.error_policy.error_threshold == 0 {
        errors.push(ValidationError::Zero {
            field: "error_policy.error_threshold",
        });
    }
    if config.error_policy.success_threshold == 0 {
        errors.push(ValidationError::Zero {
            field: "error_policy.success_threshold",
        });
    }
    if config.pool.soft_max_idle_connections > config.pool.max_cached_idle_connections {
        errors.push(ValidationError::SoftMaxAboveCached {
            soft: config.pool.soft_max_idle_connections,
            cached: config.pool.max_cached_idle_connections,
        });
    }
    if config.sticky.routing_delimiter.is_empty() {
        errors.push(ValidationError::EmptyDelimiter);
    }

    for name in config.proxy.request_headers.keys() {
        if axum::http::HeaderName::try_from(name.as_str()).is_err() {
            errors.push(ValidationError::InvalidHeaderName(name.clone()));
        }
    }

    let mut groups = HashSet::new();
    let mut routes = HashSet::new();
    for backend in &config.backends {
        groups.insert(backend.group.as_str());
        match Url::parse(&backend.uri) {
            Ok(url) if url.scheme() != "http" => errors.push(ValidationError::UnsupportedScheme {
                name: backend.name.clone(),
                scheme: url.scheme().to_string(),
            }),
            Ok(_) => {}
            Err(_) => errors.push(ValidationError::InvalidUri {
                name: backend.name.clone(),
                uri: backend.uri.clone(),
            }),
        }
        if let Some(route) = &backend.route {
            if !routes.insert((backend.group.as_str(), route.as_str())) {
                errors.push(ValidationError::DuplicateRoute {
                    group: backend.group.clone(),
                    route: route.clone(),
                });
            }
        }
    }

    for route in &config.routes {
        if !groups.contains(route.backend_group.as_str()) {
            errors.push(ValidationError::UnknownGroup {
                route: route.name.clone(),
                group: route.backend_group.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, RouteConfig};

    fn backend(name: &str, uri: &str, route: Option<&str>) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            group: "web".to_string(),
            uri: uri.to_string(),
            route: route.map(str::to_string),
            domain: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn rejects_bad_backends() {
        let mut config = ProxyConfig::default();
        config.backends = vec![
            backend("a", "http://127.0.0.1:3000", Some("n1")),
            backend("b", "https://127.0.0.1:3001", Some("n1")),
            backend("c", "::", None),
        ];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::DuplicateRoute {
            group: "web".into(),
            route: "n1".into()
        }));
    }

    #[test]
    fn rejects_unknown_group() {
        let mut config = ProxyConfig::default();
        config.routes.push(RouteConfig {
            name: "api".into(),
            host: None,
            path_prefix: Some("/api".into()),
            backend_group: "missing".into(),
            strip_prefix: false,
            priority: 0,
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::UnknownGroup {
                route: "api".into(),
                group: "missing".into()
            }]
        );
    }

    #[test]
    fn rejects_soft_max_above_cache() {
        let mut config = ProxyConfig::default();
        config.pool.soft_max_idle_connections = 20;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_invalid_injected_header_name() {
        let mut config = ProxyConfig::default();
        config
            .proxy
            .request_headers
            .insert("bad header".into(), "%{remote_addr}".into());
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::InvalidHeaderName("bad header".into())])
        );
    }
}
