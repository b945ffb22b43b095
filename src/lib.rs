//! FlowRunner - Persistent Workflow Execution Engine
//!
//! Runs long-lived, state-machine based workflows whose instances live in a
//! store. Each state of each instance runs on a worker thread; the result of
//! a run is committed back to the store as a single transition, so a crashed
//! or restarted engine simply picks the instance up again.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Workflow definitions, instances and the registry
//! - [`execution`]: State execution context, executor, worker pool and dispatcher
//! - [`store`]: Storage contract and the in-memory store
//! - [`config`]: YAML and environment configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowrunner::config::EngineConfig;
//! use flowrunner::execution::Engine;
//! use flowrunner::store::InMemoryStore;
//! use flowrunner::workflow::{State, WorkflowDefinition, WorkflowInstance, WorkflowRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     // Describe the workflow as a state machine
//!     let mut registry = WorkflowRegistry::new();
//!     registry.register(
//!         WorkflowDefinition::new("order", "validate", "error")
//!             .state(State::start("validate").handler(|ctx| {
//!                 let amount: Option<u32> = ctx.get_typed_variable("amount")?;
//!                 if amount.unwrap_or(0) == 0 {
//!                     ctx.set_next_state("error")?;
//!                 } else {
//!                     ctx.set_next_state("done")?;
//!                 }
//!                 Ok(())
//!             }))
//!             .state(State::end("done"))
//!             .state(State::end("error")),
//!     )?;
//!
//!     // Start the engine and submit an instance
//!     let store = Arc::new(InMemoryStore::new());
//!     let mut engine = Engine::new(EngineConfig::default(), store, Arc::new(registry))?;
//!     engine.start()?;
//!     engine.insert_workflow(WorkflowInstance::builder("order").variable("amount", "100").build())?;
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{BoxError, StoreError};
pub use execution::{Dispatcher, Engine, ShutdownStatus, StateExecution};
pub use store::{InMemoryStore, InstanceStore};
pub use workflow::{State, WorkflowDefinition, WorkflowInstance, WorkflowRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
