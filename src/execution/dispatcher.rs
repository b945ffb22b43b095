//! Workflow Dispatcher
//!
//! The dispatcher loop repeatedly claims due instances from the store and
//! hands one executor per instance to the worker pool. It never claims more
//! instances than the pool can start right away.
//!
//! # Lifecycle
//!
//! ```text
//! Created --run()--> Running --shutdown()--> Stopping --drain--> Stopped
//!    |                  |                                           ^
//!    |                  +--fatal poll error (pool shut, no drain)---+
//!    +--shutdown() before run() (caller drains the pool)------------+
//! ```
//!
//! A stop request is observed between iterations; a poll in progress always
//! completes and its instances are still submitted. Draining is bounded by
//! the configured shutdown timeout.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use super::executor::ExecutorFactory;
use super::panic_message;
use super::pool::{CancellationToken, DrainResult, TaskPool, CANCEL_CHECK_INTERVAL};
use crate::config::DispatcherConfig;
use crate::error::DispatcherError;
use crate::store::InstanceStore;

/// Lifecycle state of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// How a shutdown request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// The dispatcher reached `Stopped`
    Completed,
    /// The caller's token was cancelled before the dispatcher stopped
    Interrupted,
}

/// Poll loop feeding a worker pool.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::thread;
///
/// use flowrunner::config::DispatcherConfig;
/// use flowrunner::execution::{Dispatcher, WorkerPool, WorkflowExecutorFactory};
/// use flowrunner::store::InMemoryStore;
/// use flowrunner::workflow::WorkflowRegistry;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DispatcherConfig::default();
///     let store = Arc::new(InMemoryStore::new());
///     let registry = Arc::new(WorkflowRegistry::new());
///     let pool = Arc::new(WorkerPool::new("flowrunner-worker", config.pool_size)?);
///     let factory = Arc::new(WorkflowExecutorFactory::new(store.clone(), registry));
///
///     let dispatcher = Arc::new(Dispatcher::new(pool, store, factory, config));
///     let runner = {
///         let dispatcher = Arc::clone(&dispatcher);
///         thread::spawn(move || dispatcher.run())
///     };
///
///     dispatcher.shutdown();
///     runner.join().expect("dispatcher thread panicked")?;
///     Ok(())
/// }
/// ```
pub struct Dispatcher {
    pool: Arc<dyn TaskPool>,
    store: Arc<dyn InstanceStore>,
    executor_factory: Arc<dyn ExecutorFactory>,
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    state_changed: Condvar,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<dyn TaskPool>,
        store: Arc<dyn InstanceStore>,
        executor_factory: Arc<dyn ExecutorFactory>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pool,
            store,
            executor_factory,
            config,
            state: Mutex::new(DispatcherState::Created),
            state_changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Returns true once a stop was requested or the loop ended.
    pub fn is_stopping(&self) -> bool {
        matches!(
            self.state(),
            DispatcherState::Stopping | DispatcherState::Stopped
        )
    }

    /// Runs the dispatch loop on the calling thread until shutdown.
    ///
    /// Returns an error only for a fatal store error, after shutting the pool
    /// down without waiting for in-flight executors. A panic in the loop is
    /// handled the same way and then resumed.
    pub fn run(&self) -> Result<(), DispatcherError> {
        {
            let mut state = self.state.lock();
            match *state {
                DispatcherState::Created => *state = DispatcherState::Running,
                DispatcherState::Running => {
                    warn!("Dispatcher is already running");
                    return Ok(());
                }
                DispatcherState::Stopping | DispatcherState::Stopped => {
                    info!("Dispatcher was shut down before it started");
                    return Ok(());
                }
            }
        }

        info!(
            "Dispatcher started (pool size {}, batch size {}, sleep {:?})",
            self.config.pool_size, self.config.poll_batch_size, self.config.sleep_interval
        );

        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_loop())) {
            Ok(Ok(())) => {
                info!("Dispatcher stopping, waiting for running executors");
                self.shutdown_pool(true, &CancellationToken::new());
                self.mark_stopped();
                info!("Dispatcher stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Dispatcher stopped: {}", e);
                self.shutdown_pool(false, &CancellationToken::new());
                self.mark_stopped();
                Err(e)
            }
            Err(payload) => {
                error!(
                    "Dispatcher loop panicked: {}",
                    panic_message(payload.as_ref())
                );
                self.shutdown_pool(false, &CancellationToken::new());
                self.mark_stopped();
                panic::resume_unwind(payload)
            }
        }
    }

    /// Requests a stop and blocks until the dispatcher has stopped.
    pub fn shutdown(&self) -> ShutdownStatus {
        self.shutdown_interruptibly(&CancellationToken::new())
    }

    /// Requests a stop and waits until the dispatcher stopped or `token` is
    /// cancelled. The stop request stays in effect after an interruption.
    pub fn shutdown_interruptibly(&self, token: &CancellationToken) -> ShutdownStatus {
        let mut state = self.state.lock();

        match *state {
            DispatcherState::Stopped => {
                debug!("Dispatcher already stopped");
                return ShutdownStatus::Completed;
            }
            DispatcherState::Created => {
                // No loop will ever drain the pool, so do it here
                *state = DispatcherState::Stopped;
                self.state_changed.notify_all();
                drop(state);
                info!("Dispatcher shut down before it was started");
                return self.shutdown_pool(true, token);
            }
            DispatcherState::Running => {
                info!("Shutdown requested, stopping dispatcher");
                *state = DispatcherState::Stopping;
                self.state_changed.notify_all();
            }
            DispatcherState::Stopping => debug!("Dispatcher is already stopping"),
        }

        while *state != DispatcherState::Stopped {
            if token.is_cancelled() {
                warn!("Interrupted while waiting for the dispatcher to stop");
                return ShutdownStatus::Interrupted;
            }
            self.state_changed.wait_for(&mut state, CANCEL_CHECK_INTERVAL);
        }

        ShutdownStatus::Completed
    }

    fn dispatch_loop(&self) -> Result<(), DispatcherError> {
        while !self.is_stopping() {
            let capacity = self
                .pool
                .free_capacity()
                .min(self.config.poll_batch_size);
            if capacity == 0 {
                self.sleep(self.config.capacity_wait);
                continue;
            }

            match self.store.poll_next_ready_instance_ids(capacity) {
                Ok(ids) if ids.is_empty() => {
                    debug!("No workflow instances ready, sleeping {:?}", self.config.sleep_interval);
                    self.sleep(self.config.sleep_interval);
                }
                Ok(ids) => self.dispatch(ids),
                Err(e) if e.is_fatal() => return Err(DispatcherError::Fatal(e)),
                Err(e) => {
                    error!(
                        "Polling workflow instances failed, retrying after {:?}: {}",
                        self.config.sleep_interval, e
                    );
                    self.sleep(self.config.sleep_interval);
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, ids: Vec<i64>) {
        debug!("Dispatching {} workflow instances: {:?}", ids.len(), ids);

        for id in ids {
            let executor = self.executor_factory.create_executor(id);
            let submitted = self.pool.submit(Box::new(move || {
                if let Err(e) = executor.run() {
                    error!("Executor for workflow instance {} failed: {}", id, e);
                }
            }));

            if let Err(e) = submitted {
                warn!("Could not submit workflow instance {}: {}", id, e);
            }
        }
    }

    /// Sleeps for `duration` unless a stop is requested first.
    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        if *state == DispatcherState::Running {
            self.state_changed.wait_for(&mut state, duration);
        }
    }

    fn mark_stopped(&self) {
        *self.state.lock() = DispatcherState::Stopped;
        self.state_changed.notify_all();
    }

    /// Shuts the pool down, optionally waiting for it to drain. Panics raised
    /// by the pool are logged and absorbed.
    fn shutdown_pool(&self, drain: bool, token: &CancellationToken) -> ShutdownStatus {
        let timeout = self.config.shutdown_timeout;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pool.shutdown();
            if drain {
                self.pool.await_termination(timeout, token)
            } else {
                DrainResult::Drained
            }
        }));

        match result {
            Ok(DrainResult::Drained) => ShutdownStatus::Completed,
            Ok(DrainResult::TimedOut) => {
                warn!("Executors still running after {:?}, giving up on them", timeout);
                ShutdownStatus::Completed
            }
            Ok(DrainResult::Cancelled) => ShutdownStatus::Interrupted,
            Err(payload) => {
                error!(
                    "Error while shutting down worker pool: {}",
                    panic_message(payload.as_ref())
                );
                ShutdownStatus::Completed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutorError, PoolError, StoreError};
    use crate::execution::executor::{Executor, MockExecutorFactory};
    use crate::execution::pool::{Job, WorkerPool};
    use crate::store::MockInstanceStore;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::{OnceLock, Weak};
    use std::thread;

    struct FakeExecutor {
        id: i64,
        work: Option<Box<dyn FnOnce() + Send>>,
    }

    impl Executor for FakeExecutor {
        fn instance_id(&self) -> i64 {
            self.id
        }

        fn run(self: Box<Self>) -> Result<(), ExecutorError> {
            if let Some(work) = self.work {
                work();
            }
            Ok(())
        }
    }

    fn noop_executor(id: i64) -> Box<dyn Executor> {
        Box::new(FakeExecutor { id, work: None })
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            pool_size: 2,
            poll_batch_size: 2,
            sleep_interval: Duration::from_millis(10),
            capacity_wait: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    fn create_dispatcher(
        store: MockInstanceStore,
        factory: MockExecutorFactory,
    ) -> (Arc<Dispatcher>, Arc<WorkerPool>) {
        let pool = Arc::new(WorkerPool::new("test-worker", 2).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::new(store),
            Arc::new(factory),
            test_config(),
        ));
        (dispatcher, pool)
    }

    fn start(dispatcher: &Arc<Dispatcher>) -> thread::JoinHandle<Result<(), DispatcherError>> {
        let dispatcher = Arc::clone(dispatcher);
        thread::spawn(move || dispatcher.run())
    }

    #[test]
    fn test_dispatches_polled_instances_in_order() {
        let (polled_tx, polled_rx) = mpsc::channel();
        let calls = AtomicUsize::new(0);

        let mut store = MockInstanceStore::new();
        store.expect_poll_next_ready_instance_ids().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![1, 2])
            } else {
                let _ = polled_tx.send(());
                Ok(vec![])
            }
        });

        let mut seq = Sequence::new();
        let mut factory = MockExecutorFactory::new();
        factory
            .expect_create_executor()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(noop_executor);
        factory
            .expect_create_executor()
            .with(eq(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(noop_executor);

        let (dispatcher, pool) = create_dispatcher(store, factory);
        let runner = start(&dispatcher);

        polled_rx.recv().unwrap();
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        runner.join().unwrap().unwrap();

        assert!(pool.is_shutdown());
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[test]
    fn test_transient_poll_error_is_survived() {
        let slot: Arc<OnceLock<Weak<Dispatcher>>> = Arc::new(OnceLock::new());
        let (third_poll_tx, third_poll_rx) = mpsc::channel();
        let calls = AtomicUsize::new(0);

        let mut store = MockInstanceStore::new();
        {
            let slot = Arc::clone(&slot);
            store
                .expect_poll_next_ready_instance_ids()
                .times(3)
                .returning(move |_| match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(vec![1]),
                    1 => Err(StoreError::Unavailable("expected: connection reset".to_string())),
                    _ => {
                        let _ = third_poll_tx.send(());
                        // Answer only once the stop request is visible
                        while !slot
                            .get()
                            .and_then(Weak::upgrade)
                            .map_or(false, |d| d.is_stopping())
                        {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Ok(vec![2])
                    }
                });
        }

        let mut seq = Sequence::new();
        let mut factory = MockExecutorFactory::new();
        factory
            .expect_create_executor()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(noop_executor);
        factory
            .expect_create_executor()
            .with(eq(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(noop_executor);

        let (dispatcher, pool) = create_dispatcher(store, factory);
        slot.set(Arc::downgrade(&dispatcher)).unwrap();
        let runner = start(&dispatcher);

        third_poll_rx.recv().unwrap();
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        runner.join().unwrap().unwrap();

        assert!(pool.is_shutdown());
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_fatal_poll_error_stops_dispatcher() {
        let mut store = MockInstanceStore::new();
        store
            .expect_poll_next_ready_instance_ids()
            .times(1)
            .returning(|_| Err(StoreError::Fatal("expected: schema missing".to_string())));

        let mut factory = MockExecutorFactory::new();
        factory.expect_create_executor().never();

        let (dispatcher, pool) = create_dispatcher(store, factory);
        let result = dispatcher.run();

        assert!(matches!(
            result,
            Err(DispatcherError::Fatal(StoreError::Fatal(_)))
        ));
        assert!(pool.is_shutdown());
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
    }

    #[test]
    fn test_empty_polls_dispatch_nothing() {
        let (polled_tx, polled_rx) = mpsc::channel();
        let calls = AtomicUsize::new(0);

        let mut store = MockInstanceStore::new();
        store.expect_poll_next_ready_instance_ids().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                let _ = polled_tx.send(());
            }
            Ok(vec![])
        });

        let mut factory = MockExecutorFactory::new();
        factory.expect_create_executor().never();

        let (dispatcher, _pool) = create_dispatcher(store, factory);
        let runner = start(&dispatcher);

        polled_rx.recv().unwrap();
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_waits_for_running_executor() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let completed = Arc::new(AtomicBool::new(false));
        let calls = AtomicUsize::new(0);

        let mut store = MockInstanceStore::new();
        store.expect_poll_next_ready_instance_ids().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![1])
            } else {
                Ok(vec![])
            }
        });

        let work_state = Mutex::new(Some((started_tx, release_rx, Arc::clone(&completed))));
        let mut factory = MockExecutorFactory::new();
        factory
            .expect_create_executor()
            .with(eq(1))
            .times(1)
            .returning(move |id| {
                let (started_tx, release_rx, completed) = work_state.lock().take().unwrap();
                Box::new(FakeExecutor {
                    id,
                    work: Some(Box::new(move || {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        completed.store(true, Ordering::SeqCst);
                    })),
                })
            });

        let (dispatcher, pool) = create_dispatcher(store, factory);
        let runner = start(&dispatcher);

        started_rx.recv().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            release_tx.send(()).unwrap();
        });

        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        assert!(completed.load(Ordering::SeqCst));
        assert!(pool.is_shutdown());

        releaser.join().unwrap();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_interrupted_shutdown_returns_early() {
        let (polling_tx, polling_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let calls = AtomicUsize::new(0);

        let mut store = MockInstanceStore::new();
        store.expect_poll_next_ready_instance_ids().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = polling_tx.send(());
                let _ = resume_rx.recv();
            }
            Ok(vec![])
        });

        let mut factory = MockExecutorFactory::new();
        factory.expect_create_executor().never();

        let (dispatcher, pool) = create_dispatcher(store, factory);
        let runner = start(&dispatcher);
        polling_rx.recv().unwrap();

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                token.cancel();
            })
        };

        assert_eq!(
            dispatcher.shutdown_interruptibly(&token),
            ShutdownStatus::Interrupted
        );
        assert!(token.is_cancelled());
        assert!(!pool.is_shutdown());
        assert_eq!(dispatcher.state(), DispatcherState::Stopping);

        canceller.join().unwrap();
        resume_tx.send(()).unwrap();
        runner.join().unwrap().unwrap();
        assert!(pool.is_shutdown());
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[test]
    fn test_repeated_shutdown_is_a_no_op() {
        let mut store = MockInstanceStore::new();
        store
            .expect_poll_next_ready_instance_ids()
            .returning(|_| Ok(vec![]));
        let factory = MockExecutorFactory::new();

        let (dispatcher, pool) = create_dispatcher(store, factory);
        let runner = start(&dispatcher);

        while !dispatcher.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        runner.join().unwrap().unwrap();
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_shutdown_before_run() {
        let mut store = MockInstanceStore::new();
        store.expect_poll_next_ready_instance_ids().never();
        let factory = MockExecutorFactory::new();

        let (dispatcher, pool) = create_dispatcher(store, factory);

        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        assert!(pool.is_shutdown());
        assert!(dispatcher.run().is_ok());
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    struct ExplodingPool {
        inner: WorkerPool,
        shutdown_calls: AtomicUsize,
    }

    impl TaskPool for ExplodingPool {
        fn submit(&self, job: Job) -> Result<(), PoolError> {
            self.inner.submit(job)
        }

        fn free_capacity(&self) -> usize {
            self.inner.free_capacity()
        }

        fn shutdown(&self) {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            panic!("expected: pool shutdown failure");
        }

        fn await_termination(&self, timeout: Duration, token: &CancellationToken) -> DrainResult {
            self.inner.await_termination(timeout, token)
        }

        fn is_shutdown(&self) -> bool {
            self.inner.is_shutdown()
        }
    }

    #[test]
    fn test_pool_shutdown_failure_is_absorbed() {
        let mut store = MockInstanceStore::new();
        store
            .expect_poll_next_ready_instance_ids()
            .returning(|_| Ok(vec![]));
        let factory = MockExecutorFactory::new();

        let pool = Arc::new(ExplodingPool {
            inner: WorkerPool::new("test-worker", 1).unwrap(),
            shutdown_calls: AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::new(store),
            Arc::new(factory),
            test_config(),
        ));
        let runner = start(&dispatcher);

        while !dispatcher.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(dispatcher.shutdown(), ShutdownStatus::Completed);
        assert!(runner.join().unwrap().is_ok());
        assert_eq!(pool.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_full_pool_is_not_polled() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let pool = Arc::new(WorkerPool::new("test-worker", 1).unwrap());
        pool.submit(Box::new(move || {
            let _ = release_rx.recv();
        }))
        .unwrap();

        let mut store = MockInstanceStore::new();
        store.expect_poll_next_ready_instance_ids().never();
        let factory = MockExecutorFactory::new();

        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::new(store),
            Arc::new(factory),
            test_config(),
        ));
        let runner = start(&dispatcher);

        thread::sleep(Duration::from_millis(50));
        let stopper = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.shutdown())
        };
        while !dispatcher.is_stopping() {
            thread::sleep(Duration::from_millis(1));
        }
        release_tx.send(()).unwrap();

        assert_eq!(stopper.join().unwrap(), ShutdownStatus::Completed);
        runner.join().unwrap().unwrap();
    }
}
