//! Bounded worker pool.
//!
//! A fixed number of named threads consume a shared FIFO task queue. The
//! pool decouples reply computation (servers) and lane execution (blocking
//! client) from the threads doing network I/O.
//!
//! Rust threads cannot be killed, so forced shutdown is cooperative: when
//! `shutdown_and_await` runs out of time it fires the pool's
//! [`Cancellation`], discards queued tasks and gives running tasks a short
//! grace period to notice before detaching them.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{HelloError, Result};

/// How long running tasks get to observe cancellation after a forced
/// shutdown.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation flag shared between a pool and its tasks.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a pool shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All submitted work finished within the timeout.
    Completed,
    /// The timeout elapsed; queued work was discarded and running tasks
    /// exited after observing cancellation.
    Cancelled {
        /// Number of queued tasks that never ran.
        discarded: usize,
    },
    /// Some workers were still running after the grace period and were
    /// left detached.
    Detached {
        discarded: usize,
        /// Workers still alive when the pool gave up on them.
        running: usize,
    },
}

impl ShutdownOutcome {
    /// Whether forced cancellation was needed.
    pub fn was_forced(&self) -> bool {
        !matches!(self, ShutdownOutcome::Completed)
    }
}

struct State {
    queue: VecDeque<Task>,
    accepting: bool,
    alive: usize,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when work arrives or the pool stops accepting.
    work: Condvar,
    /// Signalled whenever a worker exits.
    exited: Condvar,
    cancellation: Cancellation,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one) named `{name}-{n}`.
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                accepting: true,
                alive: 0,
            }),
            work: Condvar::new(),
            exited: Condvar::new(),
            cancellation: Cancellation::new(),
        });

        let pool = WorkerPool {
            name: name.to_string(),
            shared,
            handles: Mutex::new(Vec::with_capacity(workers)),
        };

        for worker_id in 0..workers {
            let shared = Arc::clone(&pool.shared);
            shared.lock().alive += 1;
            let spawned = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || worker_loop(shared));
            match spawned {
                Ok(handle) => pool.handles().push(handle),
                Err(e) => {
                    pool.shared.lock().alive -= 1;
                    // Dropping the pool stops the workers spawned so far.
                    return Err(HelloError::Spawn(e));
                }
            }
        }

        debug!(pool = %pool.name, workers, "Worker pool started");
        Ok(pool)
    }

    /// Token fired when a shutdown is forced. Long-running tasks poll it.
    pub fn cancellation(&self) -> Cancellation {
        self.shared.cancellation.clone()
    }

    /// Queue `task` for execution. Never waits for the task to run.
    ///
    /// Returns `false` (dropping the task) once shutdown has begun.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if !state.accepting {
            return false;
        }
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.work.notify_one();
        true
    }

    /// Stop accepting work and wait up to `timeout` for queued and running
    /// tasks to finish. Forced cancellation is reported, never raised.
    pub fn shutdown_and_await(&self, timeout: Duration) -> ShutdownOutcome {
        let mut state = self.shared.lock();
        state.accepting = false;
        self.shared.work.notify_all();

        let (guard, wait) = self
            .shared
            .exited
            .wait_timeout_while(state, timeout, |s| s.alive > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;

        if !wait.timed_out() {
            drop(state);
            self.join_all();
            debug!(pool = %self.name, "Worker pool drained");
            return ShutdownOutcome::Completed;
        }

        self.shared.cancellation.cancel();
        let discarded = state.queue.len();
        state.queue.clear();
        self.shared.work.notify_all();
        warn!(
            pool = %self.name,
            discarded,
            running = state.alive,
            "Worker pool did not drain in time, cancelling"
        );

        let (guard, _) = self
            .shared
            .exited
            .wait_timeout_while(state, CANCEL_GRACE, |s| s.alive > 0)
            .unwrap_or_else(PoisonError::into_inner);
        let running = guard.alive;
        drop(guard);

        if running == 0 {
            self.join_all();
            ShutdownOutcome::Cancelled { discarded }
        } else {
            error!(pool = %self.name, running, "Worker pool did not terminate");
            self.handles().clear();
            ShutdownOutcome::Detached { discarded, running }
        }
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_all(&self) {
        let handles: Vec<_> = self.handles().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.handles().is_empty() {
            return;
        }
        // Let the workers finish whatever is queued, without blocking here.
        self.shared.lock().accepting = false;
        self.shared.work.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Some(task);
                }
                if !state.accepting {
                    break None;
                }
                state = shared
                    .work
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(task) = task else { break };
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("Worker task panicked");
        }
    }

    shared.lock().alive -= 1;
    shared.exited.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = WorkerPool::new("test", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let outcome = pool.shutdown_and_await(Duration::from_secs(5));
        assert_eq!(outcome, ShutdownOutcome::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(!pool.shutdown_and_await(Duration::from_secs(5)).was_forced());
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new("test", 2).unwrap();
        pool.shutdown_and_await(Duration::from_secs(1));
        assert!(!pool.submit(|| {}));
    }

    #[test]
    fn test_submit_does_not_block() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let cancel = pool.cancellation();
        let start = Instant::now();
        for _ in 0..3 {
            let cancel = cancel.clone();
            pool.submit(move || {
                while !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
            });
        }
        assert!(start.elapsed() < Duration::from_millis(500));
        cancel.cancel();
    }

    #[test]
    fn test_forced_cancellation_discards_queue() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let cancel = pool.cancellation();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.submit(move || {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
        });
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        let outcome = pool.shutdown_and_await(Duration::from_millis(50));
        assert_eq!(outcome, ShutdownOutcome::Cancelled { discarded: 3 });
        assert!(outcome.was_forced());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_uncooperative_task_is_detached() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.submit(|| thread::sleep(Duration::from_secs(3)));

        let outcome = pool.shutdown_and_await(Duration::from_millis(20));
        assert_eq!(
            outcome,
            ShutdownOutcome::Detached {
                discarded: 0,
                running: 1
            }
        );
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom"));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(
            pool.shutdown_and_await(Duration::from_secs(5)),
            ShutdownOutcome::Completed
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
