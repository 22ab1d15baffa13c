//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::backend::Backend;
use crate::load_balancer::{Availability, HostSelector};
use crate::net::upstream::Connector;

/// Round-robin selector.
/// Stores an internal cursor and scans at most once around the list from it.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: Connector> HostSelector<K> for RoundRobin {
    fn select(&self, backends: &[Arc<Backend<K>>]) -> Option<Arc<Backend<K>>> {
        if backends.is_empty() {
            return None;
        }

        let len = backends.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        let mut full = None;
        let mut problem = None;

        for i in 0..len {
            let backend = &backends[(start + i) % len];
            match backend.availability() {
                Availability::Available => return Some(backend.clone()),
                Availability::Full => {
                    full.get_or_insert(backend);
                }
                Availability::FullQueue | Availability::Problem => {
                    problem.get_or_insert(backend);
                }
                Availability::Closed | Availability::Drain => {}
            }
        }
        full.or(problem).cloned()
    }
}
