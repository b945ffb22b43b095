//! Error Types
//!
//! Error taxonomy shared by the store, context, executor, worker pool and
//! dispatcher. Handler failures are not represented here: handlers return a
//! [`BoxError`] which the executor folds into the instance's retry history.

use thiserror::Error;

/// Boxed error returned by state handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by an [`InstanceStore`](crate::store::InstanceStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No instance exists with the given id.
    #[error("workflow instance {0} not found")]
    NotFound(i64),

    /// The instance is no longer claimed by the committing executor.
    #[error("concurrent modification of workflow instance {0}")]
    Conflict(i64),

    /// An instance with the same type and external id already exists.
    #[error("workflow instance of type '{workflow_type}' with external id '{external_id}' already exists")]
    Duplicate {
        workflow_type: String,
        external_id: String,
    },

    /// The store could not serve the request right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An invariant of the store was violated. Stops the dispatcher.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Returns true for errors the dispatcher must not swallow.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A variable value could not be converted to or from its string form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to convert variable '{name}': {message}")]
pub struct VariableConversionError {
    pub name: String,
    pub message: String,
}

impl VariableConversionError {
    pub fn new(name: impl Into<String>, message: impl ToString) -> Self {
        Self {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// Contract violations reported by the execution context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A child workflow was rejected by the child preprocessor.
    #[error("child workflow rejected: {0}")]
    Preprocess(String),

    #[error(transparent)]
    Conversion(#[from] VariableConversionError),
}

/// Invalid workflow definitions, reported at registration time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow type must not be empty")]
    EmptyType,

    #[error("workflow '{0}' is already registered")]
    Duplicate(String),

    #[error("workflow '{workflow_type}' references unknown state '{state}'")]
    UnknownState { workflow_type: String, state: String },

    #[error("state '{state}' of workflow '{workflow_type}' has no handler")]
    MissingHandler { workflow_type: String, state: String },
}

/// Failures of a single executor run that happen outside the handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("failed to load workflow instance: {0}")]
    Load(StoreError),

    #[error("failed to commit state transition: {0}")]
    Commit(StoreError),
}

/// Worker pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors that stop the dispatcher loop.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("dispatcher stopped by fatal poll error: {0}")]
    Fatal(StoreError),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_store_errors_are_fatal() {
        assert!(StoreError::Fatal("broken".into()).is_fatal());
        assert!(!StoreError::NotFound(1).is_fatal());
        assert!(!StoreError::Conflict(1).is_fatal());
        assert!(!StoreError::Unavailable("down".into()).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StoreError::NotFound(42).to_string(),
            "workflow instance 42 not found"
        );

        let err = VariableConversionError::new("amount", "expected a number");
        assert_eq!(
            err.to_string(),
            "failed to convert variable 'amount': expected a number"
        );

        let ctx: ContextError = err.into();
        assert!(matches!(ctx, ContextError::Conversion(_)));
    }
}
