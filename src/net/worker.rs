//! Worker threads and their identity.
//!
//! # Responsibilities
//! - Assign every event-processing worker a stable, dense id (0..N)
//! - Expose the current thread's id so pools can index their shard slice
//! - Run the fixed set of worker threads, one current-thread runtime each
//!
//! # Design Decisions
//! - Ids live in a thread-local; no map lookup or lock on the hot path
//! - Threads that are not workers (admin, tests, the main runtime) map to slot 0

use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Id of the worker running on this thread, if any.
pub fn current() -> Option<usize> {
    WORKER_ID.with(|id| id.get())
}

/// Shard slot for the calling thread in a slice of `len` shards.
pub fn shard_index(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    current().map_or(0, |id| id % len)
}

/// Bind this thread to `id` until the guard is dropped.
pub fn enter(id: usize) -> WorkerGuard {
    let previous = WORKER_ID.with(|slot| slot.replace(Some(id)));
    WorkerGuard { previous }
}

/// Restores the previous worker binding on drop.
#[derive(Debug)]
pub struct WorkerGuard {
    previous: Option<usize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        WORKER_ID.with(|slot| slot.set(self.previous));
    }
}

/// Fixed pool of event-processing worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers. `make` runs on each worker thread and builds the
    /// future that thread drives to completion.
    pub fn spawn<F, Fut>(count: usize, make: F) -> std::io::Result<Self>
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let make = Arc::new(make);
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let make = make.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lb-worker-{id}"))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            tracing::error!(worker = id, error = %e, "Failed to build worker runtime");
                            return;
                        }
                    };
                    let _guard = enter(id);
                    tracing::debug!(worker = id, "Worker started");
                    runtime.block_on(make(id));
                    tracing::debug!(worker = id, "Worker stopped");
                })?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Block until every worker has returned.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_thread_uses_slot_zero() {
        assert_eq!(current(), None);
        assert_eq!(shard_index(4), 0);
    }

    #[test]
    fn guard_scopes_binding() {
        {
            let _guard = enter(5);
            assert_eq!(current(), Some(5));
            assert_eq!(shard_index(4), 1);
        }
        assert_eq!(current(), None);
    }

    #[test]
    fn bindings_are_per_thread() {
        let _guard = enter(2);
        let other = std::thread::spawn(current).join().unwrap();
        assert_eq!(other, None);
        assert_eq!(current(), Some(2));
    }

    #[test]
    fn workers_see_their_own_ids() {
        let (tx, rx) = std::sync::mpsc::channel();
        let pool = WorkerPool::spawn(3, move |id| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((id, current()));
            }
        })
        .unwrap();
        assert_eq!(pool.len(), 3);
        pool.join();

        let mut seen: Vec<_> = rx.try_iter().collect();
        seen.sort();
        assert_eq!(seen, vec![(0, Some(0)), (1, Some(1)), (2, Some(2))]);
    }
}
