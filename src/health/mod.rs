//! Backend health subsystem.
//!
//! # Data Flow
//! ```text
//! Connect outcome observed by the pool:
//!     → policy.rs (count failures within a window / successes)
//!     → Ok ←→ Problem transitions (with thresholds to prevent flapping)
//!
//! On entering Problem:
//!     → probe.rs (retry every problem_server_retry)
//!     → success feeds policy.rs, warm connection goes to the pool
//! ```
//!
//! # Design Decisions
//! - Health is passive: only real connect attempts change it
//! - Health state is per-backend, not per worker shard

pub mod policy;
pub(crate) mod probe;

pub use policy::{ErrorPolicy, HealthState};
