//! Workflow Instance Model
//!
//! The durable entity advanced by the engine. An instance is one run of a
//! workflow definition: it sits in a named state, carries string variables,
//! and becomes eligible for execution at its `next_activation` time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowInstanceStatus {
    /// Created but never executed
    #[default]
    Created,
    /// Executed at least once and still active
    InProgress,
    /// Claimed by a worker
    Executing,
    /// Reached an end state
    Finished,
    /// Waiting in a manual state for outside intervention
    Manual,
}

/// Kind of a recorded execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowActionType {
    StateExecution,
    StateExecutionFailed,
    RetryCountExceeded,
}

/// One entry of an instance's execution history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowInstanceAction {
    pub action_type: WorkflowActionType,
    /// State that was executed
    pub state: String,
    pub state_text: Option<String>,
    /// Retry count of the executed state at the time of execution
    pub retry_no: u32,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
}

/// A durable, independently schedulable state-machine run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowInstance {
    /// Assigned by the store on creation
    pub id: Option<i64>,

    /// Id of the workflow definition driving this instance
    pub workflow_type: String,

    /// Caller supplied idempotency key
    pub external_id: Option<String>,

    /// Free-form correlation key
    pub business_key: Option<String>,

    /// Name of the current state
    pub state: String,

    /// Reason recorded with the last transition
    pub state_text: Option<String>,

    pub status: WorkflowInstanceStatus,

    /// Consecutive failed or retried attempts in the current state
    pub retries: u32,

    /// When the instance becomes eligible to run; `None` means never
    pub next_activation: Option<DateTime<Utc>>,

    #[serde(default)]
    pub state_variables: HashMap<String, String>,

    /// Instance whose executor created this one
    pub parent_workflow_id: Option<i64>,

    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<WorkflowInstanceAction>,

    /// Claim held by the executor that loaded this instance, set by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<u64>,
}

impl WorkflowInstance {
    /// Starts building a new instance of the given workflow type.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::WorkflowInstance;
    ///
    /// let instance = WorkflowInstance::builder("order")
    ///     .business_key("customer-17")
    ///     .variable("amount", "100")
    ///     .build();
    /// assert_eq!(instance.workflow_type, "order");
    /// assert!(instance.id.is_none());
    /// ```
    pub fn builder(workflow_type: impl Into<String>) -> WorkflowInstanceBuilder {
        WorkflowInstanceBuilder::new(workflow_type)
    }

    /// Returns the value of a variable, if set.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.state_variables.get(name).map(String::as_str)
    }

    /// Returns true if the instance will be picked up again.
    pub fn is_scheduled(&self) -> bool {
        self.next_activation.is_some()
    }
}

/// Builder for [`WorkflowInstance`].
#[derive(Debug, Clone)]
pub struct WorkflowInstanceBuilder {
    instance: WorkflowInstance,
}

impl WorkflowInstanceBuilder {
    fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            instance: WorkflowInstance {
                id: None,
                workflow_type: workflow_type.into().trim().to_string(),
                external_id: None,
                business_key: None,
                state: String::new(),
                state_text: None,
                status: WorkflowInstanceStatus::Created,
                retries: 0,
                next_activation: None,
                state_variables: HashMap::new(),
                parent_workflow_id: None,
                created: None,
                modified: None,
                actions: Vec::new(),
                claim_token: None,
            },
        }
    }

    /// Sets the initial state. Left empty, the definition's initial state is used.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.instance.state = state.into();
        self
    }

    pub fn external_id(mut self, external_id: impl Into<String>) -> Self {
        self.instance.external_id = Some(external_id.into());
        self
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.instance.business_key = Some(business_key.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.instance
            .state_variables
            .insert(name.into(), value.into());
        self
    }

    pub fn next_activation(mut self, activation: DateTime<Utc>) -> Self {
        self.instance.next_activation = Some(activation);
        self
    }

    pub fn parent(mut self, parent_workflow_id: i64) -> Self {
        self.instance.parent_workflow_id = Some(parent_workflow_id);
        self
    }

    pub fn build(self) -> WorkflowInstance {
        self.instance
    }
}

/// Filter for [`InstanceStore::query_instances`](crate::store::InstanceStore::query_instances).
///
/// Empty lists and `None` fields do not restrict the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryWorkflowInstances {
    pub types: Vec<String>,
    pub states: Vec<String>,
    pub parent_workflow_id: Option<i64>,
    pub business_key: Option<String>,
    pub external_id: Option<String>,
    pub include_actions: bool,
    pub max_results: Option<usize>,
}

impl QueryWorkflowInstances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.types.push(workflow_type.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.states.push(state.into());
        self
    }

    pub fn with_parent(mut self, parent_workflow_id: i64) -> Self {
        self.parent_workflow_id = Some(parent_workflow_id);
        self
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_actions(mut self) -> Self {
        self.include_actions = true;
        self
    }

    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Checks whether an instance passes every restriction of this query.
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        if !self.types.is_empty() && !self.types.contains(&instance.workflow_type) {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&instance.state) {
            return false;
        }
        if self.parent_workflow_id.is_some()
            && instance.parent_workflow_id != self.parent_workflow_id
        {
            return false;
        }
        if self.business_key.is_some() && instance.business_key != self.business_key {
            return false;
        }
        if self.external_id.is_some() && instance.external_id != self.external_id {
            return false;
        }
        true
    }
}
