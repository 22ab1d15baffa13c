//! Backend group management.
//!
//! # Responsibilities
//! - Build one `LoadBalancer` per backend group from configuration
//! - Apply reloaded configuration by diffing targets
//! - Close every pool on shutdown

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::load_balancer::backend::BackendTarget;
use crate::load_balancer::balancer::LoadBalancer;
use crate::net::upstream::Connector;

type Groups<K> = HashMap<String, Arc<LoadBalancer<K>>>;

/// Outcome of applying a configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub groups: usize,
}

/// Named backend groups.
pub struct BackendManager<K: Connector> {
    connector: Arc<K>,
    shard_count: usize,
    groups: ArcSwap<Groups<K>>,
    write_lock: Mutex<()>,
}

impl<K: Connector> BackendManager<K> {
    /// Create a manager and populate it from configuration.
    pub fn new(config: &ProxyConfig, connector: Arc<K>, shard_count: usize) -> Self {
        let manager = Self {
            connector,
            shard_count: shard_count.max(1),
            groups: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        };
        manager.apply(config);
        manager
    }

    pub fn group(&self, name: &str) -> Option<Arc<LoadBalancer<K>>> {
        self.groups.load().get(name).cloned()
    }

    pub fn groups(&self) -> Arc<Groups<K>> {
        self.groups.load_full()
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Bring groups and targets in line with `config`.
    ///
    /// Targets that are unchanged keep their pools. Changed targets are
    /// replaced, never mutated. Groups that disappear are closed.
    pub fn apply(&self, config: &ProxyConfig) -> ReloadSummary {
        let _guard = self.write_lock.lock();
        let mut desired: HashMap<&str, Vec<BackendTarget>> = HashMap::new();
        for backend in &config.backends {
            match BackendTarget::parse(&backend.uri) {
                Ok(target) => {
                    let target = match &backend.route {
                        Some(route) => target.with_route(route),
                        None => target,
                    };
                    let target = match &backend.domain {
                        Some(domain) => target.with_domain(domain),
                        None => target,
                    };
                    desired.entry(backend.group.as_str()).or_default().push(target);
                }
                Err(e) => {
                    tracing::warn!(backend = %backend.name, uri = %backend.uri, error = %e, "Invalid backend uri, skipping");
                }
            }
        }

        let current = self.groups.load_full();
        let mut summary = ReloadSummary::default();
        let mut next: Groups<K> = HashMap::new();

        for (name, targets) in desired {
            let balancer = current.get(name).cloned().unwrap_or_else(|| {
                Arc::new(LoadBalancer::new(
                    self.connector.clone(),
                    &config.pool,
                    &config.error_policy,
                    &config.sticky,
                    self.shard_count,
                ))
            });

            let wanted: HashSet<&BackendTarget> = targets.iter().collect();
            for existing in balancer.targets().iter() {
                if !wanted.contains(existing.target().as_ref())
                    && balancer.remove_target(existing.target().uri()).is_some()
                {
                    summary.removed += 1;
                }
            }
            let present = balancer.targets();
            for target in targets {
                if !present.iter().any(|b| **b.target() == target) {
                    balancer.add_target(target);
                    summary.added += 1;
                }
            }
            next.insert(name.to_string(), balancer);
        }

        for (name, balancer) in current.iter() {
            if !next.contains_key(name) {
                summary.removed += balancer.targets().len();
                balancer.close();
                tracing::info!(group = %name, "Backend group removed");
            }
        }

        summary.groups = next.len();
        self.groups.store(Arc::new(next));
        tracing::info!(
            groups = summary.groups,
            added = summary.added,
            removed = summary.removed,
            "Backend configuration applied"
        );
        summary
    }

    /// Close every pool in every group.
    pub fn close(&self) {
        for balancer in self.groups.load().values() {
            balancer.close();
        }
    }
}
