//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Exchange arrives:
//!     → timeouts.rs (optional exchange deadline, caps queue waits)
//!     → connect fails: retries.rs (attempts left and deadline not passed?)
//!     → re-select a target and connect again
//! ```
//!
//! # Design Decisions
//! - The exchange deadline wins over every phase
//! - Retries are bounded by an attempt counter and the deadline
//! - Backend health is tracked by the error policy, not here

pub mod retries;
pub mod timeouts;

pub use retries::ConnectAttempts;
pub use timeouts::{Deadline, Elapsed};
