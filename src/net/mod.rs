//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (shared socket, per-worker accept, connection limits)
//!     → worker.rs (the worker thread that accepted it owns the exchange)
//!     → connection.rs (connection id, exclusive upstream slot, tracking)
//!     → Hand off to HTTP layer
//!
//! Outgoing:
//!     → upstream.rs (transport factory used by the connection pools)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Every worker accepts on a clone of one socket; the kernel balances accepts

pub mod connection;
pub mod listener;
pub mod upstream;
pub mod worker;
