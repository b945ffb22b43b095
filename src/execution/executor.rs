//! State Executor
//!
//! Runs exactly one state of one workflow instance: load the instance, call
//! the registered handler for its current state, resolve the transition and
//! write everything back in a single store commit.
//!
//! Handler errors and panics never escape an executor. They become failed
//! transitions that count against the state's retry limit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};

use super::context::StateExecution;
use super::panic_message;
use super::transition;
use crate::error::{ExecutorError, StoreError};
use crate::store::{InstanceStore, InstanceUpdate};
use crate::workflow::{
    ChildPreprocessor, DefaultChildPreprocessor, JsonVariableSerializer, StateHandler,
    VariableSerializer, WorkflowActionType, WorkflowDefinition, WorkflowInstance,
    WorkflowInstanceAction, WorkflowInstanceStatus, WorkflowRegistry,
};

/// Delay before an instance of an unregistered workflow type is looked at again.
const UNSUPPORTED_TYPE_DELAY_SECS: i64 = 60 * 60;

/// One runnable unit of work for a single instance.
pub trait Executor: Send {
    fn instance_id(&self) -> i64;

    /// Executes the instance's current state and persists the result.
    fn run(self: Box<Self>) -> Result<(), ExecutorError>;
}

/// Creates executors for polled instance ids.
#[cfg_attr(test, mockall::automock)]
pub trait ExecutorFactory: Send + Sync {
    fn create_executor(&self, instance_id: i64) -> Box<dyn Executor>;
}

/// Executes registered workflow definitions against an [`InstanceStore`].
pub struct WorkflowExecutor {
    instance_id: i64,
    store: Arc<dyn InstanceStore>,
    registry: Arc<WorkflowRegistry>,
    serializer: Arc<dyn VariableSerializer>,
    preprocessor: Arc<dyn ChildPreprocessor>,
}

impl WorkflowExecutor {
    pub fn new(
        instance_id: i64,
        store: Arc<dyn InstanceStore>,
        registry: Arc<WorkflowRegistry>,
        serializer: Arc<dyn VariableSerializer>,
        preprocessor: Arc<dyn ChildPreprocessor>,
    ) -> Self {
        Self {
            instance_id,
            store,
            registry,
            serializer,
            preprocessor,
        }
    }

    /// Runs the current state once.
    ///
    /// A missing instance is logged and skipped. Only store failures are
    /// returned as errors.
    pub fn execute(&self) -> Result<(), ExecutorError> {
        let instance = match self.store.load_instance(self.instance_id) {
            Ok(instance) => instance,
            Err(StoreError::NotFound(id)) => {
                warn!("Workflow instance {} no longer exists, skipping", id);
                return Ok(());
            }
            Err(e) => return Err(ExecutorError::Load(e)),
        };

        let Some(definition) = self.registry.definition(&instance.workflow_type) else {
            return self.reschedule_unsupported(instance);
        };

        if definition.is_final_state(&instance.state) {
            return self.settle_final_state(instance, &definition);
        }

        let started = Utc::now();
        let current_state = instance.state.clone();
        let retries = instance.retries;
        let parent_workflow_id = instance.parent_workflow_id;
        let claim_token = instance.claim_token;

        debug!(
            "Executing workflow instance {} ({}) in state '{}', retry {}",
            self.instance_id, instance.workflow_type, current_state, retries
        );

        let mut execution = StateExecution::new(
            self.instance_id,
            instance,
            Arc::clone(&self.serializer),
            Arc::clone(&self.store),
            Arc::clone(&self.preprocessor),
        );

        let error = match definition.handler_for(&current_state) {
            Some(handler) => invoke(&handler, &mut execution),
            None => Some(format!("No handler for state '{}'", current_state)),
        };

        let (instance, mut outcome) = execution.into_parts();
        let now = Utc::now();
        let transition = transition::resolve(
            &definition,
            &current_state,
            retries,
            &outcome,
            error.as_deref(),
            now,
        );

        match transition.action_type {
            WorkflowActionType::StateExecution => info!(
                "Workflow instance {}: '{}' -> '{}'",
                self.instance_id, current_state, transition.next_state
            ),
            WorkflowActionType::StateExecutionFailed => warn!(
                "Workflow instance {} failed in state '{}' (retry {}): {}",
                self.instance_id,
                current_state,
                transition.retries,
                transition.state_text.as_deref().unwrap_or("unknown error")
            ),
            WorkflowActionType::RetryCountExceeded => error!(
                "Workflow instance {} exceeded retries in state '{}', moving to '{}'",
                self.instance_id, current_state, transition.next_state
            ),
        }

        // Children and parent wake-ups only take effect for accepted executions
        let accepted = transition.action_type == WorkflowActionType::StateExecution;
        let new_children = if accepted {
            std::mem::take(&mut outcome.new_child_workflows)
        } else {
            Vec::new()
        };
        let wake_parent = if accepted && outcome.wake_up_parent_workflow {
            parent_workflow_id
        } else {
            None
        };

        let update = InstanceUpdate {
            state: transition.next_state,
            state_text: transition.state_text.clone(),
            status: transition.status,
            retries: transition.retries,
            next_activation: transition.next_activation,
            state_variables: instance.state_variables,
            new_children,
            wake_parent,
            action: Some(WorkflowInstanceAction {
                action_type: transition.action_type,
                state: current_state,
                state_text: transition.state_text,
                retry_no: retries,
                execution_start: started,
                execution_end: now,
            }),
            claim_token,
        };

        self.store
            .commit_transition(self.instance_id, update)
            .map_err(ExecutorError::Commit)
    }

    fn reschedule_unsupported(&self, instance: WorkflowInstance) -> Result<(), ExecutorError> {
        let next_activation: DateTime<Utc> =
            Utc::now() + Duration::seconds(UNSUPPORTED_TYPE_DELAY_SECS);
        warn!(
            "Workflow type '{}' of instance {} is not supported, rescheduling at {}",
            instance.workflow_type, self.instance_id, next_activation
        );

        let update = InstanceUpdate {
            state: instance.state,
            state_text: Some("Unsupported workflow type".to_string()),
            status: WorkflowInstanceStatus::InProgress,
            retries: instance.retries,
            next_activation: Some(next_activation),
            state_variables: instance.state_variables,
            new_children: Vec::new(),
            wake_parent: None,
            action: None,
            claim_token: instance.claim_token,
        };

        self.store
            .commit_transition(self.instance_id, update)
            .map_err(ExecutorError::Commit)
    }

    /// Final states have nothing to run; only the activation is cleared.
    fn settle_final_state(
        &self,
        instance: WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<(), ExecutorError> {
        debug!(
            "Workflow instance {} is already in final state '{}'",
            self.instance_id, instance.state
        );

        let update = InstanceUpdate {
            status: transition::status_for(definition, &instance.state),
            state: instance.state,
            state_text: instance.state_text,
            retries: instance.retries,
            next_activation: None,
            state_variables: instance.state_variables,
            new_children: Vec::new(),
            wake_parent: None,
            action: None,
            claim_token: instance.claim_token,
        };

        self.store
            .commit_transition(self.instance_id, update)
            .map_err(ExecutorError::Commit)
    }
}

impl Executor for WorkflowExecutor {
    fn instance_id(&self) -> i64 {
        self.instance_id
    }

    fn run(self: Box<Self>) -> Result<(), ExecutorError> {
        self.execute()
    }
}

fn invoke(handler: &StateHandler, execution: &mut StateExecution) -> Option<String> {
    match panic::catch_unwind(AssertUnwindSafe(|| (**handler)(execution))) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(format!(
            "State handler panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// Builds [`WorkflowExecutor`]s sharing one store and registry.
#[derive(Clone)]
pub struct WorkflowExecutorFactory {
    store: Arc<dyn InstanceStore>,
    registry: Arc<WorkflowRegistry>,
    serializer: Arc<dyn VariableSerializer>,
    preprocessor: Arc<dyn ChildPreprocessor>,
}

impl WorkflowExecutorFactory {
    /// Uses JSON variable conversion and [`DefaultChildPreprocessor`].
    pub fn new(store: Arc<dyn InstanceStore>, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            preprocessor: Arc::new(DefaultChildPreprocessor::new(Arc::clone(&registry))),
            serializer: Arc::new(JsonVariableSerializer),
            store,
            registry,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn VariableSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn ChildPreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn preprocessor(&self) -> Arc<dyn ChildPreprocessor> {
        Arc::clone(&self.preprocessor)
    }
}

impl ExecutorFactory for WorkflowExecutorFactory {
    fn create_executor(&self, instance_id: i64) -> Box<dyn Executor> {
        Box::new(WorkflowExecutor::new(
            instance_id,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.serializer),
            Arc::clone(&self.preprocessor),
        ))
    }
}
