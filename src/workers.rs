//! Bounded cooperative task execution with explicit admission control.
//!
//! The process runs a single [`Workers`] pool. [`Workers::dispatch`] is
//! non-blocking: it either reserves a worker for the task or refuses, and a
//! refusal is surfaced by the dispatch layer as TOO MANY REQUESTS. Workers
//! are reusable; an idle worker parks on its own channel and a janitor task
//! releases the ones idle past the configured duration.
//!
//! Tasks run to completion on one worker. Cancellation is cooperative: a
//! task observes its request deadline at its own suspension points, the
//! pool never aborts it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Upper bound on concurrently reserved workers.
pub const DEFAULT_MAX_WORKERS: usize = 256 * 1024;

/// How long an idle worker is kept before release.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

/// A unit of work accepted by the pool.
pub type Task = BoxFuture<'static, ()>;

enum Job {
    Run(Task),
    Stop,
}

struct IdleWorker {
    tx: mpsc::Sender<Job>,
    last_used: Instant,
}

struct State {
    /// LIFO stack of parked workers; the oldest sits at the front.
    ready: Vec<IdleWorker>,
    /// Live workers, parked or busy.
    count: usize,
}

struct Inner {
    max_workers: usize,
    max_idle: Duration,
    state: Mutex<State>,
    stopped: AtomicBool,
}

/// The bounded worker pool.
///
/// # Examples
///
/// ```rust
/// use fns::workers::Workers;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = Workers::new(4, Duration::from_secs(60));
/// let accepted = pool.dispatch(Box::pin(async {
///     // fn task body
/// }));
/// assert!(accepted);
/// # }
/// ```
#[derive(Clone)]
pub struct Workers {
    inner: Arc<Inner>,
}

impl Workers {
    /// Creates a pool and starts its idle-reaping janitor.
    pub fn new(max_workers: usize, max_idle: Duration) -> Self {
        let pool = Self {
            inner: Arc::new(Inner {
                max_workers: max_workers.max(1),
                max_idle,
                state: Mutex::new(State {
                    ready: Vec::new(),
                    count: 0,
                }),
                stopped: AtomicBool::new(false),
            }),
        };
        pool.spawn_janitor();
        pool
    }

    /// Tries to hand `task` to a worker without blocking.
    ///
    /// Returns false iff no slot can be reserved under the current load or
    /// the pool has stopped. On refusal the task is dropped unrun; the
    /// caller owns surfacing the refusal.
    pub fn dispatch(&self, task: Task) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        let tx = {
            let mut state = self.inner.state.lock();
            match state.ready.pop() {
                Some(worker) => worker.tx,
                None => {
                    if state.count >= self.inner.max_workers {
                        return false;
                    }
                    state.count += 1;
                    drop(state);
                    self.spawn_worker()
                }
            }
        };
        // Capacity one and the worker is parked, so this only fails if the
        // worker raced a stop between pop and send.
        match tx.try_send(Job::Run(task)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Workers currently reserved or parked.
    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Stops admission and releases every parked worker.
    ///
    /// Busy workers finish their current task and then exit instead of
    /// re-parking.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let parked = {
            let mut state = self.inner.state.lock();
            let parked: Vec<_> = state.ready.drain(..).collect();
            state.count -= parked.len();
            parked
        };
        for worker in parked {
            let _ = worker.tx.try_send(Job::Stop);
        }
    }

    fn spawn_worker(&self) -> mpsc::Sender<Job> {
        let (tx, mut rx) = mpsc::channel::<Job>(1);
        let inner = self.inner.clone();
        let own_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Run(task) => task.await,
                    Job::Stop => return,
                }
                let mut state = inner.state.lock();
                if inner.stopped.load(Ordering::Acquire) {
                    state.count -= 1;
                    return;
                }
                state.ready.push(IdleWorker {
                    tx: own_tx.clone(),
                    last_used: Instant::now(),
                });
            }
        });
        tx
    }

    fn spawn_janitor(&self) {
        let inner = self.inner.clone();
        // Sub-second idle budgets still get a timely sweep.
        let period = inner.max_idle.max(Duration::from_millis(100)).min(Duration::from_secs(10));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                let Some(cutoff) = Instant::now().checked_sub(inner.max_idle) else {
                    continue;
                };
                let expired = {
                    let mut state = inner.state.lock();
                    let keep = state
                        .ready
                        .iter()
                        .position(|w| w.last_used >= cutoff)
                        .unwrap_or(state.ready.len());
                    let expired: Vec<_> = state.ready.drain(..keep).collect();
                    state.count -= expired.len();
                    expired
                };
                if !expired.is_empty() {
                    debug!(released = expired.len(), "released idle workers");
                }
                for worker in expired {
                    let _ = worker.tx.try_send(Job::Stop);
                }
            }
        });
    }
}
