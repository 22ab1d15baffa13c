//! Backend error policy state machine.
//!
//! # States
//! - Ok: backend receives traffic
//! - Problem: backend is only tried as a last resort; recovery probes run
//!
//! # State Transitions
//! ```text
//! Ok → Problem: error_threshold consecutive failures within `interval`
//! Problem → Ok: success_threshold consecutive successes
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - A failure arriving after the window expired restarts the count at one
//! - The counters sit behind one small lock: connection shards are per-thread,
//!   but error accounting for a backend must be global

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ErrorPolicyConfig;
use crate::observability::metrics;

/// Health as decided by the error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Problem,
}

#[derive(Debug)]
struct Counters {
    state: HealthState,
    failures: u32,
    window_start: Option<Instant>,
    successes: u32,
}

/// Per-backend failure tracking with hysteresis.
#[derive(Debug)]
pub struct ErrorPolicy {
    label: String,
    error_threshold: u32,
    success_threshold: u32,
    interval: Duration,
    problem_server_retry: Duration,
    counters: Mutex<Counters>,
}

impl ErrorPolicy {
    /// Create a policy; `label` names the backend in logs and metrics.
    pub fn new(label: impl Into<String>, config: &ErrorPolicyConfig) -> Self {
        Self {
            label: label.into(),
            error_threshold: config.error_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            interval: Duration::from_secs(config.error_interval_secs),
            problem_server_retry: Duration::from_secs(config.problem_server_retry_secs),
            counters: Mutex::new(Counters {
                state: HealthState::Ok,
                failures: 0,
                window_start: None,
                successes: 0,
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        self.counters.lock().state
    }

    pub fn is_available(&self) -> bool {
        self.state() == HealthState::Ok
    }

    /// Record a failure. Returns whether the backend is still available.
    pub fn handle_error(&self) -> bool {
        let mut counters = self.counters.lock();
        match counters.state {
            HealthState::Ok => {
                let now = Instant::now();
                let window_open = counters
                    .window_start
                    .is_some_and(|start| now.duration_since(start) <= self.interval);
                if window_open {
                    counters.failures += 1;
                } else {
                    counters.window_start = Some(now);
                    counters.failures = 1;
                }
                if counters.failures >= self.error_threshold {
                    counters.state = HealthState::Problem;
                    counters.successes = 0;
                    tracing::warn!(
                        target = %self.label,
                        failures = counters.failures,
                        "Backend entered problem state"
                    );
                    metrics::record_backend_health(&self.label, false);
                }
            }
            HealthState::Problem => {
                counters.successes = 0;
            }
        }
        counters.state == HealthState::Ok
    }

    /// Record a success (a connection was established).
    pub fn clear_error(&self) {
        let mut counters = self.counters.lock();
        match counters.state {
            HealthState::Ok => {
                counters.failures = 0;
                counters.window_start = None;
            }
            HealthState::Problem => {
                counters.successes += 1;
                if counters.successes >= self.success_threshold {
                    counters.state = HealthState::Ok;
                    counters.successes = 0;
                    counters.failures = 0;
                    counters.window_start = None;
                    tracing::info!(target = %self.label, "Backend recovered");
                    metrics::record_backend_health(&self.label, true);
                }
            }
        }
    }

    /// Delay before a reconnect probe after entering problem state.
    pub fn problem_server_retry(&self) -> Duration {
        self.problem_server_retry
    }
}
