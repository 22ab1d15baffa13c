//! Target selection for one backend group.
//!
//! # Responsibilities
//! - Hold the target list and the sticky route map as swappable snapshots
//! - Select a target per exchange: sticky route first, then the host selector
//! - Add, remove and drain targets
//!
//! # Design Decisions
//! - Writers serialize on one lock and publish a fresh snapshot; readers
//!   never block and never see a half-updated list
//! - Removing a target closes its pool and forgets its sticky route

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::config::{ErrorPolicyConfig, PoolConfig, StickyConfig};
use crate::health::policy::ErrorPolicy;
use crate::load_balancer::backend::{Backend, BackendTarget};
use crate::load_balancer::pool::{ConnectionPool, PoolSettings};
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::sticky::StickySessions;
use crate::load_balancer::{Availability, HostSelector};
use crate::net::upstream::Connector;

type Targets<K> = Vec<Arc<Backend<K>>>;
type RouteMap<K> = HashMap<String, Arc<Backend<K>>>;

pub struct LoadBalancer<K: Connector> {
    targets: ArcSwap<Targets<K>>,
    routes: ArcSwap<RouteMap<K>>,
    write_lock: Mutex<()>,
    selector: Box<dyn HostSelector<K>>,
    sticky: StickySessions,
    connector: Arc<K>,
    settings: PoolSettings,
    errors: ErrorPolicyConfig,
    shard_count: usize,
}

impl<K: Connector> LoadBalancer<K> {
    pub fn new(
        connector: Arc<K>,
        pool: &PoolConfig,
        errors: &ErrorPolicyConfig,
        sticky: &StickyConfig,
        shard_count: usize,
    ) -> Self {
        Self {
            targets: ArcSwap::from_pointee(Vec::new()),
            routes: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            selector: Box::new(RoundRobin::new()),
            sticky: StickySessions::new(sticky),
            connector,
            settings: PoolSettings::from(pool),
            errors: errors.clone(),
            shard_count,
        }
    }

    /// Replace the round-robin selector.
    pub fn with_selector(mut self, selector: Box<dyn HostSelector<K>>) -> Self {
        self.selector = selector;
        self
    }

    pub fn sticky(&self) -> &StickySessions {
        &self.sticky
    }

    /// Current snapshot of the target list.
    pub fn targets(&self) -> Arc<Targets<K>> {
        self.targets.load_full()
    }

    pub fn find(&self, uri: &Url) -> Option<Arc<Backend<K>>> {
        self.targets
            .load()
            .iter()
            .find(|backend| backend.target().uri() == uri)
            .cloned()
    }

    /// Register a target and create its pool. An identical target is not
    /// added twice.
    pub fn add_target(&self, target: BackendTarget) -> Arc<Backend<K>> {
        let _guard = self.write_lock.lock();
        let current = self.targets.load_full();
        if let Some(existing) = current.iter().find(|b| **b.target() == target) {
            return existing.clone();
        }

        let target = Arc::new(target);
        let pool = ConnectionPool::new(
            target.clone(),
            self.connector.clone(),
            self.settings.clone(),
            ErrorPolicy::new(target.to_string(), &self.errors),
            self.shard_count,
        );
        let backend = Arc::new(Backend::new(target.clone(), pool));

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(backend.clone());
        self.targets.store(Arc::new(next));

        if let Some(route) = target.route() {
            let mut routes = RouteMap::clone(&self.routes.load());
            routes.insert(route.to_string(), backend.clone());
            self.routes.store(Arc::new(routes));
        }

        tracing::info!(target = %target, route = ?target.route(), "Target added");
        backend
    }

    /// Remove a target, close its pool and drop its sticky routes.
    pub fn remove_target(&self, uri: &Url) -> Option<Arc<Backend<K>>> {
        let _guard = self.write_lock.lock();
        let current = self.targets.load_full();
        let removed = current.iter().find(|b| b.target().uri() == uri)?.clone();

        let next: Targets<K> = current
            .iter()
            .filter(|b| !Arc::ptr_eq(b, &removed))
            .cloned()
            .collect();
        self.targets.store(Arc::new(next));

        let mut routes = RouteMap::clone(&self.routes.load());
        routes.retain(|_, backend| !Arc::ptr_eq(backend, &removed));
        self.routes.store(Arc::new(routes));

        removed.pool().close();
        tracing::info!(target = %removed.target(), "Target removed");
        Some(removed)
    }

    /// Stop round-robin traffic to a target; sticky sessions still reach it.
    pub fn drain_target(&self, uri: &Url) -> bool {
        match self.find(uri) {
            Some(backend) => {
                backend.pool().drain();
                true
            }
            None => false,
        }
    }

    /// Pick the target for an exchange.
    pub fn select_target(&self, headers: &HeaderMap, path: &str) -> Option<Arc<Backend<K>>> {
        if let Some(backend) = self.sticky_target(headers, path) {
            return Some(backend);
        }
        self.selector.select(&self.targets.load())
    }

    fn sticky_target(&self, headers: &HeaderMap, path: &str) -> Option<Arc<Backend<K>>> {
        let session = self.sticky.session_id(headers, path)?;
        let routes = self.sticky.routes(session);
        if routes.is_empty() {
            return None;
        }
        let map = self.routes.load();

        if !self.sticky.is_ranked() {
            let backend = map.get(routes[0])?;
            return (backend.availability() != Availability::Closed).then(|| backend.clone());
        }

        let mut fallback = None;
        for route in routes {
            let Some(backend) = map.get(route) else {
                continue;
            };
            match backend.availability() {
                Availability::Available => return Some(backend.clone()),
                Availability::Closed => {}
                _ => {
                    fallback.get_or_insert_with(|| backend.clone());
                }
            }
        }
        fallback
    }

    /// Close every pool; used on shutdown and when the group is removed.
    pub fn close(&self) {
        for backend in self.targets.load().iter() {
            backend.pool().close();
        }
    }
}

impl<K: Connector> fmt::Debug for LoadBalancer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("targets", &self.targets.load().len())
            .field("routes", &self.routes.load().len())
            .finish()
    }
}
