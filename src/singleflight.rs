//! Key-scoped collapsing of duplicate in-flight work.
//!
//! Concurrent [`Group::run`] calls with an equal key execute the supplied
//! future exactly once. The first caller becomes the leader and runs it;
//! everyone else waits on the leader's result cell and receives a clone,
//! flagged as shared. Once the leader settles, the key is forgotten and the
//! next call with that key starts a fresh execution.
//!
//! # Examples
//!
//! ```rust
//! use fns::singleflight::Group;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let group: Group<u64> = Group::new();
//! let runs = Arc::new(AtomicUsize::new(0));
//! let (value, shared) = group
//!     .run(7, {
//!         let runs = runs.clone();
//!         || async move {
//!             runs.fetch_add(1, Ordering::SeqCst);
//!             Ok(42)
//!         }
//!     })
//!     .await;
//! assert_eq!(value.unwrap(), 42);
//! assert!(!shared);
//! assert_eq!(runs.load(Ordering::SeqCst), 1);
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::errors::CodeError;

type Settled<V> = Result<V, CodeError>;

struct Call<V> {
    rx: watch::Receiver<Option<Settled<V>>>,
}

/// A group of collapsible executions keyed by a 64-bit fingerprint.
pub struct Group<V: Clone> {
    calls: DashMap<u64, Arc<Call<V>>>,
}

impl<V: Clone> Default for Group<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Group<V> {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Runs `make` exactly once per in-flight `key`.
    ///
    /// Returns the settled result plus a `shared` flag: false for the
    /// leader that actually executed, true for every collapsed waiter.
    /// A leader that panics or is cancelled drops its result cell, and
    /// waiters observe an internal error instead of hanging.
    pub async fn run<F, Fut>(&self, key: u64, make: F) -> (Settled<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Settled<V>>,
    {
        let tx = match self.calls.entry(key) {
            Entry::Occupied(entry) => {
                let call = entry.get().clone();
                drop(entry);
                return (wait(call).await, true);
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(Arc::new(Call { rx }));
                tx
            }
        };

        // Leader path. The guard forgets the key even if the future panics
        // or the leader is cancelled mid-flight, so waiters are released and
        // the key does not wedge.
        let guard = ForgetGuard { group: self, key };
        let settled = make().await;
        drop(guard);
        let _ = tx.send(Some(settled.clone()));
        (settled, false)
    }

    /// Drops any active entry for `key`.
    ///
    /// In-flight waiters keep their handle on the leader's result cell; only
    /// future callers start fresh.
    pub fn forget(&self, key: u64) {
        self.calls.remove(&key);
    }
}

struct ForgetGuard<'a, V: Clone> {
    group: &'a Group<V>,
    key: u64,
}

impl<V: Clone> Drop for ForgetGuard<'_, V> {
    fn drop(&mut self) {
        self.group.forget(self.key);
    }
}

async fn wait<V: Clone>(call: Arc<Call<V>>) -> Settled<V> {
    let mut rx = call.rx.clone();
    loop {
        if let Some(settled) = rx.borrow().as_ref() {
            return settled.clone();
        }
        if rx.changed().await.is_err() {
            // Leader dropped without settling.
            if let Some(settled) = rx.borrow().as_ref() {
                return settled.clone();
            }
            return Err(CodeError::internal("collapsed execution was interrupted"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_equal_keys_run_once() {
        let group: Arc<Group<u64>> = Arc::new(Group::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let group = group.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                group
                    .run(1, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(99)
                    })
                    .await
            }));
        }

        let mut shared_count = 0;
        for task in tasks {
            let (value, shared) = task.await.unwrap();
            assert_eq!(value.unwrap(), 99);
            if shared {
                shared_count += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(shared_count, 63);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collapse() {
        let group: Group<u64> = Group::new();
        let (a, _) = group.run(1, || async { Ok(1) }).await;
        let (b, _) = group.run(2, || async { Ok(2) }).await;
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }

    #[tokio::test]
    async fn waiters_share_failures_too() {
        let group: Arc<Group<u64>> = Arc::new(Group::new());
        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run(5, || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(CodeError::not_found("nope"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (settled, shared) = group.run(5, || async { Ok(0) }).await;
        assert!(shared);
        assert_eq!(settled.unwrap_err().code(), 404);
        let (settled, _) = leader.await.unwrap();
        assert_eq!(settled.unwrap_err().code(), 404);
    }

    #[tokio::test]
    async fn key_is_reusable_after_settlement() {
        let group: Group<u64> = Group::new();
        let runs = AtomicUsize::new(0);
        for _ in 0..3 {
            let (value, shared) = group
                .run(9, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value.unwrap(), 7);
            assert!(!shared);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
