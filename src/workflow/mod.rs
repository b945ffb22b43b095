//! Workflow Definition Module
//!
//! Data structures describing workflow types and the instances that run them.
//!
//! # Structure
//!
//! - [`definition`]: States, handlers, retry settings and the registry
//! - [`instance`]: Persistent instance records, history and queries
//! - [`serializer`]: Conversion of typed values to stored variables
//! - [`preprocessor`]: Defaults applied to newly created instances

pub mod definition;
pub mod instance;
pub mod preprocessor;
pub mod serializer;

pub use definition::{
    Backoff, State, StateHandler, StateType, WorkflowDefinition, WorkflowRegistry,
    WorkflowSettings, DEFAULT_MAX_RETRIES,
};
pub use instance::{
    QueryWorkflowInstances, WorkflowActionType, WorkflowInstance, WorkflowInstanceAction,
    WorkflowInstanceBuilder, WorkflowInstanceStatus,
};
pub use preprocessor::{ChildPreprocessor, DefaultChildPreprocessor};
pub use serializer::{JsonVariableSerializer, VariableSerializer};
