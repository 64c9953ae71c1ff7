//! Per-key mutual exclusion.
//!
//! [`PathSynchronizer::execute`] guarantees at most one in-flight operation
//! per key. The first caller for a key runs its operation; callers arriving
//! while it runs wait for it to finish and then return
//! [`Synchronized::Waited`] without running anything, leaving it to them to
//! re-check state. Different keys never block each other.
//!
//! A task that already holds a key and calls `execute` for the same key
//! again (e.g. a push callback that reads the path it is pushing) runs the
//! nested operation inline instead of waiting on itself.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::store::{StoreError, StoreResult};

tokio::task_local! {
    /// (synchronizer id, key) pairs held by the current task.
    static HELD_KEYS: RefCell<HashSet<(u64, String)>>;
}

/// Outcome of [`PathSynchronizer::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synchronized<T> {
    /// This caller ran the operation.
    Ran(T),
    /// Another caller ran an operation for the key while this one waited.
    Waited,
}

impl<T> Synchronized<T> {
    pub fn is_waited(&self) -> bool {
        matches!(self, Synchronized::Waited)
    }
}

/// Per-key exclusion shared by every overlay layer of one filesystem.
#[derive(Debug)]
pub struct PathSynchronizer {
    id: u64,
    /// Key → completion latch of the operation in flight.
    in_flight: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl Default for PathSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSynchronizer {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run `op` for `key` unless an operation for `key` is already running.
    ///
    /// An error from `op` goes to this caller only; waiters are released
    /// with `Waited` either way. After [`shutdown`](Self::shutdown), waiters
    /// and new callers get `Interrupted`.
    pub async fn execute<T, F, Fut>(&self, key: &str, op: F) -> StoreResult<Synchronized<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if key.is_empty() {
            return Err(StoreError::not_found("/"));
        }
        if self.shutdown.is_cancelled() {
            return Err(StoreError::interrupted(key));
        }
        if self.held_by_current_task(key) {
            trace!(key, "reentrant execute runs inline");
            return op().await.map(Synchronized::Ran);
        }

        let waiting_on = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(CancellationToken::new());
                None
            }
        };

        if let Some(done) = waiting_on {
            trace!(key, "waiting on in-flight operation");
            tokio::select! {
                biased;
                _ = done.cancelled() => return Ok(Synchronized::Waited),
                _ = self.shutdown.cancelled() => return Err(StoreError::interrupted(key)),
            }
        }

        let _slot = SlotGuard { sync: self, key };
        self.run_holding(key, op).await.map(Synchronized::Ran)
    }

    /// Release every waiter with `Interrupted` and refuse new operations.
    /// Operations already running are not cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of keys with an operation in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn held_by_current_task(&self, key: &str) -> bool {
        HELD_KEYS
            .try_with(|held| held.borrow().contains(&(self.id, key.to_string())))
            .unwrap_or(false)
    }

    async fn run_holding<T, F, Fut>(&self, key: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let held = (self.id, key.to_string());
        let nested = HELD_KEYS
            .try_with(|keys| {
                keys.borrow_mut().insert(held.clone());
            })
            .is_ok();

        if nested {
            let _release = HeldRelease(Some(held));
            op().await
        } else {
            HELD_KEYS
                .scope(RefCell::new(HashSet::from([held])), op())
                .await
        }
    }
}

/// Deregisters the key and wakes its waiters, also when the operation
/// fails or its future is dropped.
struct SlotGuard<'a> {
    sync: &'a PathSynchronizer,
    key: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some((_, done)) = self.sync.in_flight.remove(self.key) {
            done.cancel();
        }
    }
}

/// Removes a key from the enclosing task's held set.
struct HeldRelease(Option<(u64, String)>);

impl Drop for HeldRelease {
    fn drop(&mut self) {
        if let Some(held) = self.0.take() {
            let _ = HELD_KEYS.try_with(|keys| keys.borrow_mut().remove(&held));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_run_once() {
        const CALLERS: usize = 8;
        let sync = Arc::new(PathSynchronizer::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let mut tasks = Vec::new();
        for _ in 0..CALLERS {
            let (sync, runs, barrier) = (sync.clone(), runs.clone(), barrier.clone());
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                sync.execute("img/a.png", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
                .await
                .unwrap()
            }));
        }

        let mut ran = 0;
        for task in tasks {
            if !task.await.unwrap().is_waited() {
                ran += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(ran, 1);
        assert_eq!(sync.in_flight(), 0);

        // next round runs again
        let second = sync
            .execute("img/a.png", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(second, Synchronized::Ran(()));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let sync = PathSynchronizer::new();
        let barrier = Barrier::new(2);

        let a = sync.execute("a", || async {
            barrier.wait().await;
            Ok(1)
        });
        let b = sync.execute("b", || async {
            barrier.wait().await;
            Ok(2)
        });

        let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
            .await
            .expect("distinct keys must run concurrently");
        assert_eq!(a.unwrap(), Synchronized::Ran(1));
        assert_eq!(b.unwrap(), Synchronized::Ran(2));
    }

    #[tokio::test]
    async fn test_error_goes_to_runner_only() {
        let sync = Arc::new(PathSynchronizer::new());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let leader = {
            let (sync, started, release) = (sync.clone(), started.clone(), release.clone());
            tokio::spawn(async move {
                sync.execute("k", || async move {
                    started.notify_one();
                    release.notified().await;
                    Err::<(), _>(StoreError::remote("k", "503"))
                })
                .await
            })
        };
        started.notified().await;

        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.execute("k", || async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        assert!(matches!(leader.await.unwrap(), Err(StoreError::Remote { .. })));
        assert_eq!(waiter.await.unwrap().unwrap(), Synchronized::Waited);
        assert_eq!(sync.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reentrant_same_key_runs_inline() {
        let sync = PathSynchronizer::new();

        let outer = tokio::time::timeout(
            Duration::from_secs(5),
            sync.execute("k", || async {
                let inner = sync.execute("k", || async { Ok(7) }).await?;
                Ok(inner)
            }),
        )
        .await
        .expect("reentrant call must not deadlock")
        .unwrap();

        assert_eq!(outer, Synchronized::Ran(Synchronized::Ran(7)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let sync = Arc::new(PathSynchronizer::new());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let leader = {
            let (sync, started, release) = (sync.clone(), started.clone(), release.clone());
            tokio::spawn(async move {
                sync.execute("k", || async move {
                    started.notify_one();
                    release.notified().await;
                    Ok("done")
                })
                .await
            })
        };
        started.notified().await;

        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.execute("k", || async { Ok("never") }).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        sync.shutdown();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(StoreError::Interrupted(_))
        ));

        // the running operation is not cancelled
        release.notify_one();
        assert_eq!(leader.await.unwrap().unwrap(), Synchronized::Ran("done"));

        let late = sync.execute("other", || async { Ok(()) }).await;
        assert!(matches!(late, Err(StoreError::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_empty_key_is_not_found() {
        let sync = PathSynchronizer::new();
        let err = sync.execute("", || async { Ok(()) }).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: /");
    }

    #[tokio::test]
    async fn test_dropped_operation_releases_key() {
        let sync = PathSynchronizer::new();

        let pending = sync.execute("k", || std::future::pending::<StoreResult<()>>());
        let _ = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert_eq!(sync.in_flight(), 0);

        let again = sync.execute("k", || async { Ok(1) }).await.unwrap();
        assert_eq!(again, Synchronized::Ran(1));
    }
}
