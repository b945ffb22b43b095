//! Worker Pool
//!
//! A fixed set of named worker threads fed through a channel. Each worker
//! runs one job at a time. Shutting the pool down stops intake; jobs already
//! queued still run. Draining is bounded by a timeout and can be abandoned
//! early through a [`CancellationToken`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use super::panic_message;
use crate::error::PoolError;

/// Interval at which blocking waits re-check their cancellation token.
pub(crate) const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// A unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared flag used to abandon a blocking wait.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result of waiting for a pool to finish its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// Every worker finished
    Drained,
    /// Workers were still busy when the timeout passed
    TimedOut,
    /// The wait was cancelled
    Cancelled,
}

/// Pool operations the dispatcher relies on.
pub trait TaskPool: Send + Sync {
    /// Queues a job. Fails once the pool is shut down.
    fn submit(&self, job: Job) -> Result<(), PoolError>;

    /// Number of jobs that could start right away.
    fn free_capacity(&self) -> usize;

    /// Stops accepting jobs. Queued jobs still run.
    fn shutdown(&self);

    /// Blocks until all workers exit, the timeout passes, or `token` is cancelled.
    fn await_termination(&self, timeout: Duration, token: &CancellationToken) -> DrainResult;

    fn is_shutdown(&self) -> bool;
}

struct Shared {
    receiver: Mutex<Receiver<Job>>,
    in_flight: AtomicUsize,
    live_workers: Mutex<usize>,
    terminated: Condvar,
}

/// Fixed-size thread pool.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use flowrunner::execution::{CancellationToken, DrainResult, TaskPool, WorkerPool};
///
/// let pool = WorkerPool::new("example", 2).unwrap();
/// pool.submit(Box::new(|| println!("working"))).unwrap();
/// pool.shutdown();
///
/// let result = pool.await_termination(Duration::from_secs(5), &CancellationToken::new());
/// assert_eq!(result, DrainResult::Drained);
/// ```
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Job>>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Starts `size` worker threads named `{name}-{n}`.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self, PoolError> {
        let name = name.into();
        let (tx, rx) = channel::<Job>();
        let shared = Arc::new(Shared {
            receiver: Mutex::new(rx),
            in_flight: AtomicUsize::new(0),
            live_workers: Mutex::new(0),
            terminated: Condvar::new(),
        });

        let pool = Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            shared,
        };

        for index in 0..size {
            let shared = Arc::clone(&pool.shared);
            *pool.shared.live_workers.lock() += 1;

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", pool.name, index + 1))
                .spawn(move || worker_loop(shared));

            if let Err(e) = spawned {
                *pool.shared.live_workers.lock() -= 1;
                pool.shutdown();
                return Err(PoolError::Spawn(e));
            }
        }

        info!("Started worker pool '{}' with {} threads", pool.name, size);
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Returns true once every worker thread has exited.
    pub fn is_terminated(&self) -> bool {
        *self.shared.live_workers.lock() == 0
    }
}

impl TaskPool for WorkerPool {
    fn submit(&self, job: Job) -> Result<(), PoolError> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(PoolError::ShutDown);
        };

        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::ShutDown);
        }
        Ok(())
    }

    fn free_capacity(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        self.size.saturating_sub(self.in_flight())
    }

    fn shutdown(&self) {
        // Dropping the sender lets workers finish the queue and exit
        if self.sender.lock().take().is_some() {
            info!(
                "Shutting down worker pool '{}' ({} jobs in flight)",
                self.name,
                self.in_flight()
            );
        }
    }

    fn await_termination(&self, timeout: Duration, token: &CancellationToken) -> DrainResult {
        let deadline = Instant::now() + timeout;
        let mut live = self.shared.live_workers.lock();

        while *live > 0 {
            if token.is_cancelled() {
                debug!("Waiting for worker pool '{}' was cancelled", self.name);
                return DrainResult::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return DrainResult::TimedOut;
            }
            let slice = (deadline - now).min(CANCEL_CHECK_INTERVAL);
            self.shared.terminated.wait_for(&mut live, slice);
        }

        DrainResult::Drained
    }

    fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        // Only the receive holds the lock; the job runs unlocked
        let job = shared.receiver.lock().recv();
        let Ok(job) = job else {
            break;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                "Job panicked on {}: {}",
                thread::current().name().unwrap_or("worker"),
                panic_message(payload.as_ref())
            );
        }
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    let mut live = shared.live_workers.lock();
    *live -= 1;
    if *live == 0 {
        shared.terminated.notify_all();
    }
}
