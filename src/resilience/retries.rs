//! Connect retry accounting.
//!
//! # Responsibilities
//! - Bound the number of connect attempts per exchange
//! - Stop retrying once the exchange deadline has passed
//!
//! # Design Decisions
//! - Retries happen only before any byte is sent upstream, so they are
//!   safe for every method
//! - No backoff: the next attempt re-selects a target immediately

use crate::resilience::timeouts::Deadline;

/// Attempt counter for one exchange.
#[derive(Debug, Clone)]
pub struct ConnectAttempts {
    attempt: u32,
    max_retries: u32,
    deadline: Deadline,
}

impl ConnectAttempts {
    pub fn new(max_retries: u32, deadline: Deadline) -> Self {
        Self {
            attempt: 1,
            max_retries,
            deadline,
        }
    }

    /// The current attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Move to the next attempt if one is left.
    pub fn retry(&mut self) -> bool {
        if self.attempt > self.max_retries || self.deadline.is_expired() {
            return false;
        }
        self.attempt += 1;
        true
    }
}
