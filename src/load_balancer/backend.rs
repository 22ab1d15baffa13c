//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream server (`BackendTarget`)
//! - Pair a target with the connection pool that serves it (`Backend`)
//!
//! # Design Decisions
//! - Targets are immutable; a configuration change replaces the whole `Backend`
//! - The pool owns all per-target state; the target is identity only

use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::load_balancer::pool::ConnectionPool;
use crate::load_balancer::Availability;
use crate::net::upstream::Connector;

/// One upstream host the proxy can forward to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    uri: Url,
    route: Option<String>,
    domain: Option<String>,
}

impl BackendTarget {
    /// Create a target for the given base URI.
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            route: None,
            domain: None,
        }
    }

    /// Parse a target from a URI string such as `http://10.0.0.5:8080/app`.
    pub fn parse(uri: &str) -> Result<Self, url::ParseError> {
        Url::parse(uri).map(Self::new)
    }

    /// Attach the route id used for sticky sessions.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Attach a domain (group) tag.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    /// Host as it appears in an authority (IPv6 literals keep their brackets).
    pub fn host(&self) -> &str {
        self.uri.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.uri.port_or_known_default().unwrap_or(80)
    }

    /// `host:port`, suitable for connecting and for a rewritten Host header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Base path requests are mounted under, without a trailing slash.
    pub fn base_path(&self) -> &str {
        self.uri.path().trim_end_matches('/')
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// A target together with the pool of connections to it.
pub struct Backend<K: Connector> {
    target: Arc<BackendTarget>,
    pool: ConnectionPool<K>,
}

impl<K: Connector> Backend<K> {
    pub fn new(target: Arc<BackendTarget>, pool: ConnectionPool<K>) -> Self {
        Self { target, pool }
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        &self.target
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    /// Availability as seen from the calling worker's shard.
    pub fn availability(&self) -> Availability {
        self.pool.availability()
    }
}

impl<K: Connector> fmt::Debug for Backend<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("target", &self.target.to_string())
            .field("availability", &self.availability())
            .finish()
    }
}
