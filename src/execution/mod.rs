//! Workflow Execution Module
//!
//! Runs workflow instances: a dispatcher polls the store for due instances
//! and hands each one to a worker pool, where an executor runs the current
//! state's handler and commits the resulting transition.
//!
//! # Architecture
//!
//! - [`context`]: API handed to state handlers
//! - [`transition`]: Pure policy for next state, retries and activation
//! - [`executor`]: Runs one state of one instance
//! - [`pool`]: Fixed-size worker threads
//! - [`dispatcher`]: Poll loop and shutdown protocol
//! - [`engine`]: Wires everything together on a background thread

use std::any::Any;

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod pool;
pub mod transition;

pub use context::{StateExecution, StateOutcome};
pub use dispatcher::{Dispatcher, DispatcherState, ShutdownStatus};
pub use engine::Engine;
pub use executor::{Executor, ExecutorFactory, WorkflowExecutor, WorkflowExecutorFactory};
pub use pool::{CancellationToken, DrainResult, Job, TaskPool, WorkerPool};

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
