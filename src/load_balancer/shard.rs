//! Per-worker connection shard.
//!
//! # Responsibilities
//! - Hold one worker's open-connection count, idle connections and waiters
//! - Decide, for one connect request, between reuse, open, queue and reject
//! - Hand returning connections to the oldest live waiter before idling them
//!
//! # Design Decisions
//! - A shard is only touched by the worker that owns it; its lock is never
//!   contended and exists so the pool stays `Sync`
//! - `available` is ordered oldest-first: reuse takes the most recently
//!   returned connection, eviction takes the longest idle one
//! - `open` counts every charged connection, idle or in use, so
//!   `open >= available.len()` always holds

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::PoolError;
use crate::load_balancer::pool::{PoolSettings, PooledConnection};
use crate::net::upstream::{Connector, UpstreamConnection};

pub(crate) type Grant<K> = Result<PooledConnection<K>, PoolError>;

/// An idle, reusable connection.
pub(crate) struct IdleConnection<C> {
    pub(crate) conn: C,
    pub(crate) expires_at: Option<Instant>,
}

/// One exchange queued for a connection.
pub(crate) struct Waiter<K: Connector> {
    grant: oneshot::Sender<Grant<K>>,
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl<K: Connector> Waiter<K> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.grant.is_closed()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Deliver a connection. On failure the connection comes back.
    pub(crate) fn grant(self, conn: PooledConnection<K>) -> Result<(), PooledConnection<K>> {
        match self.grant.send(Ok(conn)) {
            Ok(()) => Ok(()),
            Err(Ok(conn)) => Err(conn),
            Err(Err(_)) => Ok(()),
        }
    }

    pub(crate) fn fail(self, err: PoolError) {
        let _ = self.grant.send(Err(err));
    }
}

/// The awaiting side of a queued connect.
pub(crate) struct Ticket<K: Connector> {
    rx: oneshot::Receiver<Grant<K>>,
    expires_at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl<K: Connector> Ticket<K> {
    /// Wait for a grant or for the deadline, whichever comes first.
    pub(crate) async fn wait(mut self) -> Grant<K> {
        let Some(deadline) = self.expires_at else {
            return self.rx.await.unwrap_or(Err(PoolError::Closed));
        };
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(grant) => grant.unwrap_or(Err(PoolError::Closed)),
            Err(_) => {
                self.cancelled.store(true, Ordering::Release);
                self.rx.close();
                // A grant may have landed between the alarm and the close.
                self.rx.try_recv().unwrap_or(Err(PoolError::Timeout))
            }
        }
    }
}

/// Pending idle-expiry alarm.
pub(crate) struct IdleAlarm {
    pub(crate) deadline: Instant,
    pub(crate) task: AbortHandle,
}

/// What a connect request should do next.
pub(crate) enum Checkout<K: Connector> {
    /// An idle connection was taken.
    Ready(K::Connection),
    /// Open a new connection; the shard has already been charged unless exclusive.
    Open,
    /// Queue is full.
    Rejected,
    /// Wait on the ticket.
    Queued(Ticket<K>),
}

/// One worker's partition of a pool.
pub(crate) struct ConnectionShard<K: Connector> {
    pub(crate) open: usize,
    pub(crate) available: VecDeque<IdleConnection<K::Connection>>,
    pub(crate) awaiting: VecDeque<Waiter<K>>,
    pub(crate) idle_alarm: Option<IdleAlarm>,
}

impl<K: Connector> ConnectionShard<K> {
    pub(crate) fn new() -> Self {
        Self {
            open: 0,
            available: VecDeque::new(),
            awaiting: VecDeque::new(),
            idle_alarm: None,
        }
    }

    pub(crate) fn checkout(
        &mut self,
        settings: &PoolSettings,
        exclusive: bool,
        expires_at: Option<Instant>,
    ) -> Checkout<K> {
        while let Some(idle) = self.available.pop_back() {
            if idle.conn.is_open() {
                if exclusive {
                    // exclusive connections leave the pool's accounting
                    self.open = self.open.saturating_sub(1);
                }
                return Checkout::Ready(idle.conn);
            }
            self.open = self.open.saturating_sub(1);
        }

        if exclusive {
            return Checkout::Open;
        }
        if self.open < settings.max_connections {
            self.open += 1;
            return Checkout::Open;
        }
        self.awaiting.retain(|waiter| !waiter.is_cancelled());
        if self.awaiting.len() >= settings.max_queue_size {
            return Checkout::Rejected;
        }

        let (grant, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.awaiting.push_back(Waiter {
            grant,
            expires_at,
            cancelled: cancelled.clone(),
        });
        Checkout::Queued(Ticket {
            rx,
            expires_at,
            cancelled,
        })
    }

    pub(crate) fn live_waiters(&self) -> usize {
        self.awaiting.iter().filter(|waiter| !waiter.is_cancelled()).count()
    }

    /// Oldest waiter that is still interested.
    pub(crate) fn next_waiter(&mut self) -> Option<Waiter<K>> {
        while let Some(waiter) = self.awaiting.pop_front() {
            if !waiter.is_cancelled() {
                return Some(waiter);
            }
        }
        None
    }

    /// Give `conn` to the oldest live waiter. Returns it when nobody takes it.
    ///
    /// The connection stays charged against `open` across the hand-off.
    pub(crate) fn hand_to_waiter(
        &mut self,
        mut conn: K::Connection,
        wrap: impl Fn(K::Connection) -> PooledConnection<K>,
    ) -> Option<K::Connection> {
        while let Some(waiter) = self.next_waiter() {
            match waiter.grant(wrap(conn)) {
                Ok(()) => return None,
                Err(back) => conn = back.disarm()?,
            }
        }
        Some(conn)
    }

    /// Close idle connections and fail every waiter.
    pub(crate) fn shut_down(&mut self) {
        let idle = self.available.len();
        self.available.clear();
        self.open = self.open.saturating_sub(idle);
        while let Some(waiter) = self.awaiting.pop_front() {
            waiter.fail(PoolError::Closed);
        }
        if let Some(alarm) = self.idle_alarm.take() {
            alarm.task.abort();
        }
    }
}
