//! Connection pool for one backend target.
//!
//! # Responsibilities
//! - Own one shard per worker thread, created lazily on first access
//! - connect / return / close with the queueing and capacity rules below
//! - Expire idle connections above the soft max after their TTL
//! - Report connect outcomes to the error policy and schedule recovery probes
//!
//! # Data Flow
//! ```text
//! connect()
//!     → idle connection on this shard?          → hand over
//!     → exclusive or open < max?                → open a new connection
//!     → queue full?                             → QueueRejected
//!     → otherwise                               → queue a waiter (optional deadline)
//!
//! return_connection()
//!     → pool closed                             → close, fail waiters
//!     → closed / upgraded                       → release charge, serve next waiter
//!     → waiter queued                           → hand over directly
//!     → otherwise                               → idle list (+ TTL alarm)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::health::policy::ErrorPolicy;
use crate::health::probe;
use crate::load_balancer::backend::BackendTarget;
use crate::load_balancer::shard::{Checkout, ConnectionShard, IdleAlarm, IdleConnection, Waiter};
use crate::load_balancer::Availability;
use crate::net::upstream::{Connector, UpstreamConnection};
use crate::net::worker;
use crate::observability::metrics;

/// Capacity and idle policy of a pool, per worker shard.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Charged connections per shard.
    pub max_connections: usize,
    /// Hard cap on idle connections per shard.
    pub max_cached_idle: usize,
    /// Idle connections kept regardless of TTL.
    pub soft_max_idle: usize,
    /// Idle time after which connections above the soft max are closed.
    pub idle_ttl: Option<Duration>,
    /// Waiters allowed per shard once at capacity.
    pub max_queue_size: usize,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_connections: config.max_connections_per_thread,
            max_cached_idle: config.max_cached_idle_connections,
            soft_max_idle: config.soft_max_idle_connections,
            idle_ttl: config
                .idle_connection_ttl_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            max_queue_size: config.max_queue_size,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

/// Point-in-time view across all shards.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub waiting: usize,
    pub opened_total: u64,
    pub reused_total: u64,
    pub returned_total: u64,
    pub failed_total: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    failed: AtomicU64,
}

pub(crate) struct PoolInner<K: Connector> {
    target: Arc<BackendTarget>,
    label: String,
    connector: Arc<K>,
    settings: PoolSettings,
    errors: ErrorPolicy,
    closed: AtomicBool,
    draining: AtomicBool,
    probing: AtomicBool,
    counters: Counters,
    shards: Box<[OnceLock<Mutex<ConnectionShard<K>>>]>,
}

/// Connections to one backend, partitioned per worker thread.
pub struct ConnectionPool<K: Connector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: Connector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Connector> fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning handle used by background tasks.
pub(crate) struct WeakPool<K: Connector>(Weak<PoolInner<K>>);

impl<K: Connector> WeakPool<K> {
    pub(crate) fn upgrade(&self) -> Option<ConnectionPool<K>> {
        self.0.upgrade().map(|inner| ConnectionPool { inner })
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Create a pool with `shard_count` worker slots.
    pub fn new(
        target: Arc<BackendTarget>,
        connector: Arc<K>,
        settings: PoolSettings,
        errors: ErrorPolicy,
        shard_count: usize,
    ) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| OnceLock::new()).collect();
        Self {
            inner: Arc::new(PoolInner {
                label: target.to_string(),
                target,
                connector,
                settings,
                errors,
                closed: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                probing: AtomicBool::new(false),
                counters: Counters::default(),
                shards,
            }),
        }
    }

    /// Whether both handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        &self.inner.target
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn error_policy(&self) -> &ErrorPolicy {
        &self.inner.errors
    }

    pub(crate) fn connector(&self) -> &K {
        &self.inner.connector
    }

    pub(crate) fn downgrade(&self) -> WeakPool<K> {
        WeakPool(Arc::downgrade(&self.inner))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    fn shard(&self, idx: usize) -> MutexGuard<'_, ConnectionShard<K>> {
        self.inner.shards[idx]
            .get_or_init(|| Mutex::new(ConnectionShard::new()))
            .lock()
    }

    fn current_shard(&self) -> usize {
        worker::shard_index(self.inner.shards.len())
    }

    fn wrap(&self, conn: K::Connection, idx: usize, exclusive: bool) -> PooledConnection<K> {
        PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            shard: idx,
            exclusive,
            reused: false,
        }
    }

    /// Availability as seen from the calling worker's shard.
    pub fn availability(&self) -> Availability {
        if self.is_closed() {
            return Availability::Closed;
        }
        if self.is_draining() {
            return Availability::Drain;
        }
        if !self.inner.errors.is_available() {
            return Availability::Problem;
        }
        let settings = &self.inner.settings;
        let shard = self.shard(self.current_shard());
        if shard.open < settings.max_connections || !shard.available.is_empty() {
            Availability::Available
        } else if shard.live_waiters() >= settings.max_queue_size {
            Availability::FullQueue
        } else {
            Availability::Full
        }
    }

    /// Obtain a connection for one exchange.
    ///
    /// `exclusive` connections are not charged against the shard and never
    /// return to it. `wait` bounds the time spent queued.
    pub async fn connect(
        &self,
        exclusive: bool,
        wait: Option<Duration>,
    ) -> Result<PooledConnection<K>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let idx = self.current_shard();
        let expires_at = wait.map(|w| Instant::now() + w);
        let checkout = self
            .shard(idx)
            .checkout(&self.inner.settings, exclusive, expires_at);

        match checkout {
            Checkout::Ready(conn) => {
                self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target = %self.inner.label, shard = idx, "Reusing idle connection");
                let mut pooled = self.wrap(conn, idx, exclusive);
                pooled.reused = true;
                Ok(pooled)
            }
            Checkout::Open => self.open_connection(idx, exclusive).await,
            Checkout::Rejected => {
                tracing::debug!(target = %self.inner.label, shard = idx, "Connection queue full, rejecting");
                metrics::record_pool_event(&self.inner.label, "rejected");
                Err(PoolError::QueueRejected)
            }
            Checkout::Queued(ticket) => {
                tracing::debug!(target = %self.inner.label, shard = idx, "Pool at capacity, queueing request");
                metrics::record_pool_event(&self.inner.label, "queued");
                let grant = ticket.wait().await;
                if matches!(grant, Err(PoolError::Timeout)) {
                    metrics::record_pool_event(&self.inner.label, "timed_out");
                }
                grant
            }
        }
    }

    async fn open_connection(
        &self,
        idx: usize,
        exclusive: bool,
    ) -> Result<PooledConnection<K>, PoolError> {
        // Cancelled mid-connect: the charge goes back and the next waiter is served.
        let charge = (!exclusive).then(|| Charge { pool: self, idx });
        let result = self.inner.connector.connect(&self.inner.target).await;
        if let Some(charge) = charge {
            std::mem::forget(charge);
        }

        match result {
            Ok(conn) => {
                if self.is_closed() {
                    drop(conn);
                    if !exclusive {
                        self.release_charge(idx);
                    }
                    return Err(PoolError::Closed);
                }
                self.inner.errors.clear_error();
                self.inner.counters.opened.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_event(&self.inner.label, "opened");
                tracing::debug!(target = %self.inner.label, shard = idx, exclusive, "Opened upstream connection");
                Ok(self.wrap(conn, idx, exclusive))
            }
            Err(e) => {
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_event(&self.inner.label, "failed");
                tracing::warn!(target = %self.inner.label, shard = idx, error = %e, "Failed to connect to backend");
                if self.inner.errors.handle_error() {
                    // Still usable: the freed slot goes to the next waiter.
                    if !exclusive {
                        self.connection_closed(idx);
                    }
                } else {
                    if !exclusive {
                        self.release_charge(idx);
                    }
                    self.redistribute_queued(idx);
                    self.schedule_probe(idx);
                }
                Err(PoolError::ConnectFailed(e))
            }
        }
    }

    fn release_charge(&self, idx: usize) {
        let mut shard = self.shard(idx);
        shard.open = shard.open.saturating_sub(1);
    }

    /// Send every live waiter on this shard elsewhere, exactly once each.
    fn redistribute_queued(&self, idx: usize) {
        let now = Instant::now();
        let mut shard = self.shard(idx);
        while let Some(waiter) = shard.next_waiter() {
            if waiter.is_expired(now) {
                waiter.fail(PoolError::Timeout);
            } else {
                waiter.fail(PoolError::Redistributed);
            }
        }
    }

    fn schedule_probe(&self, idx: usize) {
        let retry = self.inner.errors.problem_server_retry();
        if retry.is_zero() || self.inner.errors.is_available() {
            return;
        }
        if self.inner.probing.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(target = %self.inner.label, retry_secs = retry.as_secs(), "Scheduling reconnect probe");
                handle.spawn(probe::recover(self.downgrade(), idx, retry));
            }
            Err(_) => self.probe_finished(),
        }
    }

    pub(crate) fn probe_finished(&self) {
        self.inner.probing.store(false, Ordering::Release);
    }

    /// Whether a reconnect probe is pending or running.
    pub fn is_probing(&self) -> bool {
        self.inner.probing.load(Ordering::Acquire)
    }

    /// Take a connection opened by a recovery probe into the pool.
    pub(crate) fn adopt_warm(&self, idx: usize, conn: K::Connection) {
        {
            let mut shard = self.shard(idx);
            if shard.open >= self.inner.settings.max_connections {
                return;
            }
            shard.open += 1;
        }
        self.return_connection(self.wrap(conn, idx, false));
    }

    /// Give a connection back after a completed exchange.
    pub fn return_connection(&self, pooled: PooledConnection<K>) {
        let idx = pooled.shard;
        let exclusive = pooled.exclusive;
        let Some(conn) = pooled.disarm() else {
            return;
        };
        if exclusive {
            return;
        }

        if self.is_closed() {
            drop(conn);
            let mut shard = self.shard(idx);
            shard.open = shard.open.saturating_sub(1);
            shard.shut_down();
            return;
        }
        if !conn.is_open() || conn.is_upgraded() {
            drop(conn);
            self.connection_closed(idx);
            return;
        }

        self.inner.counters.returned.fetch_add(1, Ordering::Relaxed);
        let settings = &self.inner.settings;
        let mut shard = self.shard(idx);
        let Some(conn) = shard.hand_to_waiter(conn, |c| self.wrap(c, idx, false)) else {
            tracing::trace!(target = %self.inner.label, shard = idx, "Handed returned connection to waiter");
            return;
        };

        if settings.max_cached_idle == 0 {
            drop(conn);
            shard.open = shard.open.saturating_sub(1);
            return;
        }
        if shard.available.len() >= settings.max_cached_idle && shard.available.pop_front().is_some() {
            shard.open = shard.open.saturating_sub(1);
            metrics::record_pool_event(&self.inner.label, "evicted");
        }

        let expires_at = settings.idle_ttl.map(|ttl| Instant::now() + ttl);
        shard.available.push_back(IdleConnection { conn, expires_at });

        if shard.available.len() > settings.soft_max_idle && shard.idle_alarm.is_none() {
            if let Some(deadline) = shard.available.front().and_then(|idle| idle.expires_at) {
                shard.idle_alarm = self.arm_idle_alarm(idx, deadline);
            }
        }
    }

    fn arm_idle_alarm(&self, idx: usize, deadline: Instant) -> Option<IdleAlarm> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let pool = self.downgrade();
        let task = handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(pool) = pool.upgrade() {
                pool.expire_idle(idx);
            }
        });
        Some(IdleAlarm {
            deadline,
            task: task.abort_handle(),
        })
    }

    /// One pass of idle expiry: close expired connections above the soft max,
    /// oldest first, then re-arm once for the next expiry.
    fn expire_idle(&self, idx: usize) {
        let now = Instant::now();
        let soft_max = self.inner.settings.soft_max_idle;
        let mut shard = self.shard(idx);
        shard.idle_alarm = None;
        let mut evicted = 0usize;

        while shard.available.len() > soft_max {
            let Some(front) = shard.available.front() else {
                break;
            };
            let expiry = front.expires_at;
            if !front.conn.is_open() || expiry.is_some_and(|at| at <= now) {
                shard.available.pop_front();
                shard.open = shard.open.saturating_sub(1);
                evicted += 1;
                continue;
            }
            if let Some(at) = expiry {
                shard.idle_alarm = self.arm_idle_alarm(idx, at);
            }
            break;
        }

        if evicted > 0 {
            tracing::debug!(target = %self.inner.label, shard = idx, evicted, "Expired idle connections");
            metrics::record_pool_event(&self.inner.label, "evicted");
        }
    }

    /// Account for a charged connection that is gone, and use the freed
    /// capacity for the next waiter.
    fn connection_closed(&self, idx: usize) {
        let waiter = {
            let mut shard = self.shard(idx);
            shard.open = shard.open.saturating_sub(1);
            if self.is_closed() || shard.open >= self.inner.settings.max_connections {
                return;
            }
            let Some(waiter) = shard.next_waiter() else {
                return;
            };
            shard.open += 1;
            waiter
        };
        self.open_for_waiter(idx, waiter);
    }

    fn open_for_waiter(&self, idx: usize, waiter: Waiter<K>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.release_charge(idx);
            waiter.fail(PoolError::Closed);
            return;
        };
        let pool = self.clone();
        handle.spawn(async move {
            match pool.open_connection(idx, false).await {
                Ok(conn) => {
                    if let Err(conn) = waiter.grant(conn) {
                        pool.return_connection(conn);
                    }
                }
                Err(e) => waiter.fail(e),
            }
        });
    }

    /// Stop accepting traffic except sticky sessions.
    pub fn drain(&self) {
        if !self.inner.draining.swap(true, Ordering::AcqRel) {
            tracing::info!(target = %self.inner.label, "Draining backend");
        }
    }

    /// Close the pool. Idle connections are closed now, in-flight ones when
    /// they come back.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in self.inner.shards.iter() {
            if let Some(shard) = slot.get() {
                shard.lock().shut_down();
            }
        }
        tracing::info!(target = %self.inner.label, "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            opened_total: self.inner.counters.opened.load(Ordering::Relaxed),
            reused_total: self.inner.counters.reused.load(Ordering::Relaxed),
            returned_total: self.inner.counters.returned.load(Ordering::Relaxed),
            failed_total: self.inner.counters.failed.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for slot in self.inner.shards.iter() {
            if let Some(shard) = slot.get() {
                let shard = shard.lock();
                stats.open += shard.open;
                stats.idle += shard.available.len();
                stats.waiting += shard.live_waiters();
            }
        }
        stats
    }

    #[cfg(test)]
    pub(crate) fn idle_alarm_deadline(&self, idx: usize) -> Option<Instant> {
        self.shard(idx).idle_alarm.as_ref().map(|alarm| alarm.deadline)
    }
}

/// Shard charge held across an in-flight connect.
struct Charge<'a, K: Connector> {
    pool: &'a ConnectionPool<K>,
    idx: usize,
}

impl<K: Connector> Drop for Charge<'_, K> {
    fn drop(&mut self) {
        self.pool.connection_closed(self.idx);
    }
}

/// A connection checked out of a pool.
///
/// Dropping it without returning it closes the transport and releases the
/// shard's charge.
pub struct PooledConnection<K: Connector> {
    conn: Option<K::Connection>,
    pool: ConnectionPool<K>,
    shard: usize,
    exclusive: bool,
    reused: bool,
}

impl<K: Connector> PooledConnection<K> {
    pub fn connection(&self) -> Option<&K::Connection> {
        self.conn.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut K::Connection> {
        self.conn.as_mut()
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        self.pool.target()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether the connection came from the idle list rather than a fresh connect.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_open())
    }

    /// Take the transport out without any accounting side effect.
    pub(crate) fn disarm(mut self) -> Option<K::Connection> {
        self.conn.take()
    }

    /// Hand the transport over for good (protocol upgrade). The pool forgets
    /// it; `return_connection` is never involved.
    pub fn detach(mut self) -> Option<K::Connection> {
        let conn = self.conn.take();
        if conn.is_some() && !self.exclusive {
            self.pool.connection_closed(self.shard);
        }
        conn
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            if !self.exclusive {
                self.pool.connection_closed(self.shard);
            }
        }
    }
}

impl<K: Connector> fmt::Debug for PooledConnection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.inner.label)
            .field("shard", &self.shard)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{error_policy, ms, pool, pool_for, settle, FakeConnector};

    fn settings(max_connections: usize, max_queue_size: usize) -> PoolSettings {
        PoolSettings {
            max_connections,
            max_cached_idle: 8,
            soft_max_idle: 8,
            idle_ttl: None,
            max_queue_size,
        }
    }

    fn id(conn: &PooledConnection<FakeConnector>) -> usize {
        conn.connection().map(|c| c.id).unwrap_or_default()
    }

    fn queue(
        pool: &ConnectionPool<FakeConnector>,
        wait: Option<Duration>,
    ) -> tokio::task::JoinHandle<Result<PooledConnection<FakeConnector>, PoolError>> {
        let pool = pool.clone();
        tokio::spawn(async move { pool.connect(false, wait).await })
    }

    #[tokio::test]
    async fn open_count_never_exceeds_max() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(2, 10));

        let first = pool.connect(false, None).await.unwrap();
        let _second = pool.connect(false, None).await.unwrap();
        let third = queue(&pool, None);
        settle().await;

        let stats = pool.stats();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.waiting, 1);
        assert_eq!(connector.connects(), 2);

        pool.return_connection(first);
        let third = third.await.unwrap().unwrap();
        assert_eq!(id(&third), 1);
        assert_eq!(pool.stats().open, 2);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn returned_connection_goes_to_oldest_waiter() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 10));

        let held = pool.connect(false, None).await.unwrap();
        let oldest = queue(&pool, None);
        settle().await;
        let newest = queue(&pool, None);
        settle().await;
        assert_eq!(pool.stats().waiting, 2);

        pool.return_connection(held);
        let granted = oldest.await.unwrap().unwrap();
        assert_eq!(id(&granted), 1);
        assert_eq!(pool.stats().idle, 0, "handed over, never idled");
        assert!(!newest.is_finished());

        pool.return_connection(granted);
        let granted = newest.await.unwrap().unwrap();
        assert_eq!(id(&granted), 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.stats().returned_total, 2);
    }

    #[tokio::test]
    async fn zero_queue_rejects_immediately() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 0));

        let _held = pool.connect(false, None).await.unwrap();
        assert_eq!(pool.availability(), Availability::FullQueue);
        let err = pool.connect(false, Some(ms(500))).await.unwrap_err();
        assert!(matches!(err, PoolError::QueueRejected));
        assert_eq!(pool.stats().waiting, 0);
        assert!(pool.error_policy().is_available(), "backpressure is not a health signal");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_put_backend_in_problem_and_schedule_probe() {
        let connector = FakeConnector::new();
        connector.set_failing(true);
        let pool = pool_for("http://fake:80", &connector, settings(4, 10), error_policy(5, 10));

        for _ in 0..4 {
            assert!(matches!(pool.connect(false, None).await, Err(PoolError::ConnectFailed(_))));
            assert_eq!(pool.availability(), Availability::Available);
        }
        assert!(!pool.is_probing());

        assert!(pool.connect(false, None).await.is_err());
        assert_eq!(pool.availability(), Availability::Problem);
        assert!(pool.is_probing());
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.stats().failed_total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_above_soft_max_expire_oldest_first() {
        let connector = FakeConnector::new();
        let pool = pool(
            &connector,
            PoolSettings {
                max_connections: 10,
                max_cached_idle: 10,
                soft_max_idle: 2,
                idle_ttl: Some(Duration::from_secs(1)),
                max_queue_size: 10,
            },
        );

        let mut conns = Vec::new();
        for _ in 0..5 {
            conns.push(pool.connect(false, None).await.unwrap());
        }
        for conn in conns {
            pool.return_connection(conn);
        }
        assert_eq!(pool.stats().idle, 5);
        assert!(pool.idle_alarm_deadline(0).is_some());

        tokio::time::sleep(ms(1100)).await;
        settle().await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.open, 2);
        assert!(pool.idle_alarm_deadline(0).is_none());

        let newest = pool.connect(false, None).await.unwrap();
        let next = pool.connect(false, None).await.unwrap();
        assert_eq!((id(&newest), id(&next)), (5, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_times_out_and_connection_idles() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 10));

        let held = pool.connect(false, None).await.unwrap();
        let waiter = queue(&pool, Some(ms(100)));
        settle().await;
        tokio::time::sleep(ms(150)).await;

        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Timeout)));
        pool.return_connection(held);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_closes_returns() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 10));

        let held = pool.connect(false, None).await.unwrap();
        let waiter = queue(&pool, None);
        settle().await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert_eq!(pool.availability(), Availability::Closed);

        pool.return_connection(held);
        let stats = pool.stats();
        assert_eq!((stats.open, stats.idle), (0, 0));
        assert!(matches!(pool.connect(false, None).await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn exclusive_connections_are_uncounted() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 10));

        let exclusive = pool.connect(true, None).await.unwrap();
        assert!(exclusive.is_exclusive());
        assert_eq!(pool.stats().open, 0);

        let _regular = pool.connect(false, None).await.unwrap();
        assert_eq!(pool.stats().open, 1);

        pool.return_connection(exclusive);
        let stats = pool.stats();
        assert_eq!((stats.open, stats.idle), (1, 0));
    }

    #[tokio::test]
    async fn failed_connect_releases_charge() {
        let connector = FakeConnector::new();
        connector.set_failing(true);
        let pool = pool(&connector, settings(1, 10));

        assert!(pool.connect(false, None).await.is_err());
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.availability(), Availability::Problem);
    }

    #[tokio::test]
    async fn dropped_connection_frees_capacity_for_waiter() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 10));

        let held = pool.connect(false, None).await.unwrap();
        let waiter = queue(&pool, None);
        settle().await;

        drop(held);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(id(&granted), 2);
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn detached_connection_leaves_the_pool() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 10));

        let upgraded = pool.connect(false, None).await.unwrap();
        let raw = upgraded.detach();
        assert!(raw.is_some());
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.stats().returned_total, 0);
    }

    #[tokio::test]
    async fn closed_transport_is_not_idled() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(2, 10));

        let mut conn = pool.connect(false, None).await.unwrap();
        if let Some(c) = conn.connection_mut() {
            c.close();
        }
        pool.return_connection(conn);
        let stats = pool.stats();
        assert_eq!((stats.open, stats.idle), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_below_threshold_serves_next_waiter() {
        let connector = FakeConnector::new();
        connector.set_failing(true);
        connector.delay_connects(ms(100));
        let pool = pool_for("http://fake:80", &connector, settings(1, 10), error_policy(5, 10));

        let first = queue(&pool, None);
        settle().await;
        let second = queue(&pool, None);
        settle().await;
        assert_eq!(pool.stats().waiting, 1);

        assert!(matches!(first.await.unwrap(), Err(PoolError::ConnectFailed(_))));
        assert!(matches!(second.await.unwrap(), Err(PoolError::ConnectFailed(_))));
        assert_eq!(connector.connects(), 2, "freed slot reopened for the waiter");

        let stats = pool.stats();
        assert_eq!((stats.open, stats.waiting), (0, 0));
        assert_eq!(pool.availability(), Availability::Available);
    }

    #[tokio::test]
    async fn idle_cap_evicts_longest_idle() {
        let connector = FakeConnector::new();
        let pool = pool(
            &connector,
            PoolSettings {
                max_connections: 10,
                max_cached_idle: 2,
                soft_max_idle: 2,
                idle_ttl: None,
                max_queue_size: 10,
            },
        );

        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pool.connect(false, None).await.unwrap());
        }
        for conn in conns {
            pool.return_connection(conn);
        }

        let stats = pool.stats();
        assert_eq!((stats.open, stats.idle), (2, 2));
        assert_eq!(stats.returned_total, 3);

        let newest = pool.connect(false, None).await.unwrap();
        let next = pool.connect(false, None).await.unwrap();
        assert_eq!((id(&newest), id(&next)), (3, 2));
        let fresh = pool.connect(false, None).await.unwrap();
        assert_eq!(id(&fresh), 4, "connection 1 was evicted");
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_redistributes_each_waiter_once() {
        let connector = FakeConnector::new();
        let pool = pool_for("http://fake:80", &connector, settings(1, 10), error_policy(1, 10));

        let held = pool.connect(false, None).await.unwrap();
        let lapsed = queue(&pool, Some(ms(50)));
        let patient = queue(&pool, None);
        let bounded = queue(&pool, Some(Duration::from_secs(30)));
        settle().await;
        tokio::time::sleep(ms(100)).await;
        assert!(matches!(lapsed.await.unwrap(), Err(PoolError::Timeout)));

        connector.set_failing(true);
        assert!(pool.connect(true, None).await.is_err());
        assert_eq!(pool.availability(), Availability::Problem);

        assert!(matches!(patient.await.unwrap(), Err(PoolError::Redistributed)));
        assert!(matches!(bounded.await.unwrap(), Err(PoolError::Redistributed)));
        assert_eq!(pool.stats().waiting, 0);

        // nobody is left to hand the returned connection to
        pool.return_connection(held);
        let stats = pool.stats();
        assert_eq!((stats.open, stats.idle), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiters_do_not_fill_the_queue() {
        let connector = FakeConnector::new();
        let pool = pool(&connector, settings(1, 1));

        let _held = pool.connect(false, None).await.unwrap();
        let waiter = queue(&pool, Some(ms(50)));
        settle().await;
        assert_eq!(pool.availability(), Availability::FullQueue);

        tokio::time::sleep(ms(100)).await;
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Timeout)));
        assert_eq!(pool.availability(), Availability::Full);
        assert_eq!(pool.stats().waiting, 0);
    }
}
