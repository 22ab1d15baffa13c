//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match path prefix (case-sensitive, on segment boundaries)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive (RFC 9110)
//! - Path matching is case-sensitive
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

/// The parts of a request routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub host: Option<&'a str>,
    pub path: &'a str,
}

impl<'a> RouteRequest<'a> {
    pub fn new(host: Option<&'a str>, path: &'a str) -> Self {
        Self { host, path }
    }
}

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &RouteRequest<'_>) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

/// Host without a trailing `:port` (IPv6 literals keep their brackets).
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &RouteRequest<'_>) -> bool {
        req.host
            .map(strip_port)
            .is_some_and(|h| h.eq_ignore_ascii_case(&self.expected_host))
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Remainder of `path` after the prefix, always starting with `/`.
    pub fn strip<'a>(&self, path: &'a str) -> &'a str {
        let prefix = self.prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, req: &RouteRequest<'_>) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        match req.path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with(';') || prefix.is_empty(),
            None => false,
        }
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &RouteRequest<'_>) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}
