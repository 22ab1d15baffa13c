//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → router.rs (route lookup)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: matched Route + relative path, or NoMatch
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Sort by priority
//!     → Compile matchers
//!     → Freeze as immutable Router, swapped in atomically
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - First match wins (ordered by priority)

pub mod matcher;
pub mod router;

pub use router::{Route, RouteMatch, Router};
