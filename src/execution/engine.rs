//! Workflow Engine
//!
//! Wires a store, a workflow registry, the worker pool and the dispatcher
//! together and runs the dispatcher on its own thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};

use super::dispatcher::{Dispatcher, ShutdownStatus};
use super::executor::WorkflowExecutorFactory;
use super::pool::{CancellationToken, WorkerPool};
use crate::config::EngineConfig;
use crate::error::{BoxError, DispatcherError, PoolError, StoreError};
use crate::store::InstanceStore;
use crate::workflow::{ChildPreprocessor, QueryWorkflowInstances, WorkflowInstance, WorkflowRegistry};

/// Name prefix of worker threads.
const WORKER_THREAD_NAME: &str = "flowrunner-worker";

/// Name of the dispatcher thread.
const DISPATCHER_THREAD_NAME: &str = "flowrunner-dispatcher";

/// Running workflow engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use flowrunner::config::EngineConfig;
/// use flowrunner::execution::Engine;
/// use flowrunner::store::InMemoryStore;
/// use flowrunner::workflow::{State, WorkflowDefinition, WorkflowInstance, WorkflowRegistry};
///
/// fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let mut registry = WorkflowRegistry::new();
///     registry.register(
///         WorkflowDefinition::new("greeting", "hello", "error")
///             .state(State::start("hello").handler(|ctx| {
///                 ctx.set_next_state("done")?;
///                 Ok(())
///             }))
///             .state(State::end("done"))
///             .state(State::end("error")),
///     )?;
///
///     let store = Arc::new(InMemoryStore::new());
///     let mut engine = Engine::new(EngineConfig::default(), store, Arc::new(registry))?;
///     engine.start()?;
///     engine.insert_workflow(WorkflowInstance::builder("greeting").build())?;
///
///     engine.shutdown();
///     Ok(())
/// }
/// ```
pub struct Engine {
    store: Arc<dyn InstanceStore>,
    preprocessor: Arc<dyn ChildPreprocessor>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    handle: Option<JoinHandle<Result<(), DispatcherError>>>,
}

impl Engine {
    /// Creates the worker pool and dispatcher. Nothing is polled until [`Engine::start`].
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn InstanceStore>,
        registry: Arc<WorkflowRegistry>,
    ) -> Result<Self, PoolError> {
        let factory = WorkflowExecutorFactory::new(Arc::clone(&store), registry);
        let preprocessor = factory.preprocessor();

        let pool = Arc::new(WorkerPool::new(
            WORKER_THREAD_NAME,
            config.dispatcher.pool_size,
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::clone(&store),
            Arc::new(factory),
            config.dispatcher,
        ));

        Ok(Self {
            store,
            preprocessor,
            pool,
            dispatcher,
            handle: None,
        })
    }

    /// Starts the dispatcher thread.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.handle.is_some() {
            warn!("Engine already started");
            return Ok(());
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = thread::Builder::new()
            .name(DISPATCHER_THREAD_NAME.to_string())
            .spawn(move || dispatcher.run())?;

        self.handle = Some(handle);
        info!("Engine started");
        Ok(())
    }

    /// Fills in definition defaults and stores a new root instance.
    pub fn insert_workflow(&self, instance: WorkflowInstance) -> Result<i64, BoxError> {
        let instance = self.preprocessor.process(instance)?;
        let workflow_type = instance.workflow_type.clone();

        let ids = self.store.create_instances(vec![instance])?;
        let id = ids
            .first()
            .copied()
            .ok_or("store returned no id for the created instance")?;

        info!("Inserted workflow instance {} ({})", id, workflow_type);
        Ok(id)
    }

    pub fn load_workflow(&self, id: i64) -> Result<WorkflowInstance, StoreError> {
        self.store.load_instance(id)
    }

    pub fn query_workflows(
        &self,
        query: &QueryWorkflowInstances,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        self.store.query_instances(query)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stops the dispatcher, drains the pool and joins the dispatcher thread.
    pub fn shutdown(&mut self) -> ShutdownStatus {
        self.shutdown_interruptibly(&CancellationToken::new())
    }

    /// Like [`Engine::shutdown`], but gives up waiting once `token` is cancelled.
    pub fn shutdown_interruptibly(&mut self, token: &CancellationToken) -> ShutdownStatus {
        let status = self.dispatcher.shutdown_interruptibly(token);
        if status == ShutdownStatus::Interrupted {
            return status;
        }

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Dispatcher ended with error: {}", e),
                Err(_) => error!("Dispatcher thread panicked"),
            }
        }

        info!("Engine stopped");
        status
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Request the stop without waiting for it
            let token = CancellationToken::new();
            token.cancel();
            self.dispatcher.shutdown_interruptibly(&token);
        }
    }
}
