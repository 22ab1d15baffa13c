//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Compute the relative path forwarded to the backend
//!
//! # Design Decisions
//! - Immutable after construction; a reload builds a new router
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Explicit no-match rather than silent default

use crate::config::RouteConfig;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher, RouteRequest};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub backend_group: String,
    priority: u32,
    matcher: AndMatcher,
    strip: Option<PathPrefixMatcher>,
}

/// Result of a successful lookup.
#[derive(Debug)]
pub struct RouteMatch<'r, 'p> {
    pub route: &'r Route,
    /// Path relative to the backend's base path.
    pub relative_path: &'p str,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn from_config(configs: Vec<RouteConfig>) -> Self {
        let mut routes: Vec<Route> = configs
            .into_iter()
            .map(|config| {
                let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
                if let Some(host) = &config.host {
                    matchers.push(Box::new(HostMatcher::new(host.clone())));
                }
                if let Some(prefix) = &config.path_prefix {
                    matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
                }
                let strip = match (&config.path_prefix, config.strip_prefix) {
                    (Some(prefix), true) => Some(PathPrefixMatcher::new(prefix.clone())),
                    _ => None,
                };
                Route {
                    name: config.name,
                    backend_group: config.backend_group,
                    priority: config.priority,
                    matcher: AndMatcher::new(matchers),
                    strip,
                }
            })
            .collect();
        // Stable sort keeps config order among equal priorities.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        tracing::debug!(routes = routes.len(), "Routes compiled");
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn match_request<'r, 'p>(&'r self, host: Option<&str>, path: &'p str) -> Option<RouteMatch<'r, 'p>> {
        let req = RouteRequest::new(host, path);
        let route = self.routes.iter().find(|route| route.matcher.matches(&req))?;
        let relative_path = match &route.strip {
            Some(prefix) => prefix.strip(path),
            None => path,
        };
        Some(RouteMatch { route, relative_path })
    }
}
