//! Exchange deadlines.
//!
//! # Responsibilities
//! - Represent the optional maximum duration of one exchange
//! - Bound queue waits by whatever is left of it
//! - Race any phase of the exchange against it
//!
//! # Design Decisions
//! - Uses Tokio's timer (so paused-time tests drive it)
//! - A missing deadline never expires

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// The instant an exchange must be finished by, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

/// Returned when a deadline elapses first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `limit` from now; `None` means unbounded.
    pub fn after(limit: Option<Duration>) -> Self {
        Self(limit.map(|limit| Instant::now() + limit))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| at <= Instant::now())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The shorter of `wait` and the time left.
    pub fn cap(&self, wait: Option<Duration>) -> Option<Duration> {
        match (wait, self.remaining()) {
            (Some(wait), Some(left)) => Some(wait.min(left)),
            (wait, left) => wait.or(left),
        }
    }

    /// Run `fut` to completion unless the deadline passes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        match self.0 {
            Some(at) => tokio::time::timeout_at(at, fut).await.map_err(|_| Elapsed),
            None => Ok(fut.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cap_takes_the_shorter_bound() {
        let deadline = Deadline::after(Some(Duration::from_secs(5)));
        assert_eq!(deadline.cap(Some(Duration::from_secs(1))), Some(Duration::from_secs(1)));
        assert_eq!(deadline.cap(Some(Duration::from_secs(9))), Some(Duration::from_secs(5)));
        assert_eq!(deadline.cap(None), Some(Duration::from_secs(5)));
        assert_eq!(Deadline::none().cap(None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_at_deadline() {
        let deadline = Deadline::after(Some(Duration::from_millis(100)));
        let slow = tokio::time::sleep(Duration::from_secs(1));
        assert_eq!(deadline.run(slow).await, Err(Elapsed));
        assert!(deadline.is_expired());
        assert_eq!(Deadline::none().run(async { 7 }).await, Ok(7));
    }
}
