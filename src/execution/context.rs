//! State Execution Context
//!
//! A [`StateExecution`] is handed to the handler of the current state. It is
//! the only thing a handler can change: variables, the next state, retry and
//! failure flags, and child workflows to create. Once the handler returns the
//! executor takes it apart with [`StateExecution::into_parts`] and interprets
//! the resulting [`StateOutcome`] as a whole.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ContextError, StoreError, VariableConversionError};
use crate::store::InstanceStore;
use crate::workflow::{ChildPreprocessor, QueryWorkflowInstances, VariableSerializer, WorkflowInstance};

/// What a handler asked for, collected during one state execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOutcome {
    /// State to move to
    pub next_state: Option<String>,
    pub next_state_reason: Option<String>,
    /// Explicit activation time; `None` leaves the choice to the executor
    pub next_activation: Option<DateTime<Utc>>,
    /// Run the same state again later without counting it as an error
    pub is_retry: bool,
    pub failed: bool,
    pub failure_cause: Option<String>,
    pub retry_count_exceeded: bool,
    pub wake_up_parent_workflow: bool,
    /// Children to create, already preprocessed, in the order they were added
    pub new_child_workflows: Vec<WorkflowInstance>,
}

/// Mutable API available to a state handler.
pub struct StateExecution {
    instance_id: i64,
    instance: WorkflowInstance,
    serializer: Arc<dyn VariableSerializer>,
    store: Arc<dyn InstanceStore>,
    preprocessor: Arc<dyn ChildPreprocessor>,
    outcome: StateOutcome,
}

impl StateExecution {
    pub fn new(
        instance_id: i64,
        instance: WorkflowInstance,
        serializer: Arc<dyn VariableSerializer>,
        store: Arc<dyn InstanceStore>,
        preprocessor: Arc<dyn ChildPreprocessor>,
    ) -> Self {
        Self {
            instance_id,
            instance,
            serializer,
            store,
            preprocessor,
            outcome: StateOutcome::default(),
        }
    }

    pub fn workflow_instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn external_id(&self) -> Option<&str> {
        self.instance.external_id.as_deref()
    }

    pub fn business_key(&self) -> Option<&str> {
        self.instance.business_key.as_deref()
    }

    pub fn current_state_name(&self) -> &str {
        &self.instance.state
    }

    pub fn retries(&self) -> u32 {
        self.instance.retries
    }

    /// Returns the current value of a variable.
    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.instance.state_variables.get(name).map(String::as_str)
    }

    /// Returns the current value of a variable, or `default` when unset.
    pub fn get_variable_or(&self, name: &str, default: &str) -> String {
        self.get_variable(name).unwrap_or(default).to_string()
    }

    /// Reads a variable through the variable serializer.
    ///
    /// Returns `Ok(None)` when the variable is not set.
    pub fn get_typed_variable<T>(&self, name: &str) -> Result<Option<T>, VariableConversionError>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.instance.state_variables.get(name) else {
            return Ok(None);
        };

        let value = self.serializer.from_string(name, raw)?;
        match serde_json::from_value::<T>(value) {
            Ok(converted) => Ok(Some(converted)),
            // Text that happens to parse as JSON may still be wanted as a string
            Err(e) => serde_json::from_value::<T>(Value::String(raw.clone()))
                .map(Some)
                .map_err(|_| VariableConversionError::new(name, e)),
        }
    }

    /// Sets a variable. Visible to later reads in the same execution.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.instance
            .state_variables
            .insert(name.into(), value.into());
    }

    /// Serializes a value through the variable serializer and stores it.
    pub fn set_typed_variable<T>(&mut self, name: &str, value: &T) -> Result<(), VariableConversionError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value).map_err(|e| VariableConversionError::new(name, e))?;
        let raw = self.serializer.to_string(name, value)?;
        self.set_variable(name, raw);
        Ok(())
    }

    /// Names the state to move to. Empty names are rejected.
    pub fn set_next_state(&mut self, state: &str) -> Result<(), ContextError> {
        let state = state.trim();
        if state.is_empty() {
            return Err(ContextError::IllegalArgument(
                "next state can not be empty".to_string(),
            ));
        }
        self.outcome.next_state = Some(state.to_string());
        Ok(())
    }

    pub fn set_next_activation(&mut self, activation: Option<DateTime<Utc>>) {
        self.outcome.next_activation = activation;
    }

    pub fn set_next_state_reason(&mut self, reason: impl Into<String>) {
        self.outcome.next_state_reason = Some(reason.into());
    }

    pub fn set_retry(&mut self, is_retry: bool) {
        self.outcome.is_retry = is_retry;
    }

    pub fn set_failed(&mut self) {
        self.outcome.failed = true;
    }

    pub fn set_failed_with(&mut self, cause: impl fmt::Display) {
        self.outcome.failed = true;
        self.outcome.failure_cause = Some(cause.to_string());
    }

    pub fn set_retry_count_exceeded(&mut self) {
        self.outcome.retry_count_exceeded = true;
    }

    pub fn wake_up_parent_workflow(&mut self) {
        self.outcome.wake_up_parent_workflow = true;
    }

    /// Queues child workflows for creation together with this transition.
    ///
    /// Each child goes through the child preprocessor. An empty batch adds
    /// nothing. The batch is rejected as a whole if a child has no workflow
    /// type or the preprocessor refuses one of them.
    pub fn add_child_workflows<I>(&mut self, children: I) -> Result<(), ContextError>
    where
        I: IntoIterator<Item = WorkflowInstance>,
    {
        let children: Vec<WorkflowInstance> = children.into_iter().collect();
        if children.iter().any(|c| c.workflow_type.trim().is_empty()) {
            return Err(ContextError::IllegalArgument(
                "child workflow must have a workflow type".to_string(),
            ));
        }

        let processed = children
            .into_iter()
            .map(|child| self.preprocessor.process(child))
            .collect::<Result<Vec<_>, _>>()?;

        self.outcome.new_child_workflows.extend(processed);
        Ok(())
    }

    pub fn new_child_workflows(&self) -> &[WorkflowInstance] {
        &self.outcome.new_child_workflows
    }

    /// Queries instances created by this instance.
    ///
    /// The parent restriction of `query` is always replaced with this instance.
    pub fn query_child_workflows(
        &self,
        query: &QueryWorkflowInstances,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut restricted = query.clone();
        restricted.parent_workflow_id = Some(self.instance_id);
        self.store.query_instances(&restricted)
    }

    pub fn next_state(&self) -> Option<&str> {
        self.outcome.next_state.as_deref()
    }

    pub fn next_activation(&self) -> Option<DateTime<Utc>> {
        self.outcome.next_activation
    }

    pub fn is_retry(&self) -> bool {
        self.outcome.is_retry
    }

    pub fn is_failed(&self) -> bool {
        self.outcome.failed
    }

    pub fn is_retry_count_exceeded(&self) -> bool {
        self.outcome.retry_count_exceeded
    }

    pub fn is_wake_up_parent_workflow_set(&self) -> bool {
        self.outcome.wake_up_parent_workflow
    }

    /// Returns the current variable map.
    pub fn variables(&self) -> &HashMap<String, String> {
        &self.instance.state_variables
    }

    /// Splits the execution into the instance (with updated variables) and the outcome.
    pub fn into_parts(self) -> (WorkflowInstance, StateOutcome) {
        (self.instance, self.outcome)
    }
}

impl fmt::Debug for StateExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateExecution")
            .field("instance_id", &self.instance_id)
            .field("state", &self.instance.state)
            .field("outcome", &self.outcome)
            .finish()
    }
}
