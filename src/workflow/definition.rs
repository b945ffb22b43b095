//! Workflow Definitions
//!
//! A workflow definition names its states and binds a handler to every state
//! that does work. Definitions are collected in a [`WorkflowRegistry`], the
//! dispatch table the executor consults to find the handler, retry limit and
//! failure state for an instance's current state.
//!
//! # Example
//!
//! ```
//! use flowrunner::workflow::{State, WorkflowDefinition, WorkflowRegistry};
//!
//! let definition = WorkflowDefinition::new("greeting", "begin", "error")
//!     .state(State::start("begin").handler(|execution| {
//!         execution.set_variable("greeting", "hello");
//!         execution.set_next_state("done")?;
//!         Ok(())
//!     }))
//!     .state(State::end("done"))
//!     .state(State::end("error"));
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register(definition).unwrap();
//! assert!(registry.handler_for("greeting", "begin").is_some());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use log::info;

use crate::error::{BoxError, DefinitionError};
use crate::execution::StateExecution;

/// Default number of retries before a state is routed to its failure state.
pub const DEFAULT_MAX_RETRIES: u32 = 17;

/// Function executed for one state of a workflow instance.
pub type StateHandler = Arc<dyn Fn(&mut StateExecution) -> Result<(), BoxError> + Send + Sync>;

/// Role of a state inside its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    /// Entry point of the workflow
    Start,
    /// Intermediate state doing work
    Normal,
    /// Waits for outside intervention; never activated automatically
    Manual,
    /// Terminal state
    End,
}

impl StateType {
    /// Returns true for states that are never scheduled again.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Manual | Self::End)
    }
}

/// A named step of a workflow definition.
#[derive(Clone)]
pub struct State {
    pub name: String,
    pub state_type: StateType,
    pub description: Option<String>,
    handler: Option<StateHandler>,
    max_retries: Option<u32>,
    failure_state: Option<String>,
}

impl State {
    fn new(name: impl Into<String>, state_type: StateType) -> Self {
        Self {
            name: name.into().trim().to_string(),
            state_type,
            description: None,
            handler: None,
            max_retries: None,
            failure_state: None,
        }
    }

    pub fn start(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Start)
    }

    pub fn normal(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Normal)
    }

    pub fn manual(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Manual)
    }

    pub fn end(name: impl Into<String>) -> Self {
        Self::new(name, StateType::End)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Binds the function executed when an instance is in this state.
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut StateExecution) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Overrides the workflow-wide retry limit for this state.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// State to move to once the retry limit is exceeded.
    pub fn failure_state(mut self, state: impl Into<String>) -> Self {
        self.failure_state = Some(state.into());
        self
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("state_type", &self.state_type)
            .field("has_handler", &self.handler.is_some())
            .field("max_retries", &self.max_retries)
            .field("failure_state", &self.failure_state)
            .finish()
    }
}

/// Delay curve applied before re-running a failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay for every retry
    Fixed(Duration),
    /// `min * 2^retries`, capped at `max`. Overflow saturates to `max`.
    Exponential { min: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the next attempt after `retries` earlier failures.
    pub fn delay(&self, retries: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { min, max } => {
                if min <= Duration::zero() {
                    return min.max(Duration::zero()).min(max);
                }
                let mut delay = min;
                for _ in 0..retries {
                    if delay >= max {
                        break;
                    }
                    delay = delay.checked_add(&delay).unwrap_or(max);
                }
                delay.min(max)
            }
        }
    }
}

/// Timing and retry settings shared by all states of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub max_retries: u32,
    /// Delay used when a handler asks to be retried without failing
    pub short_transition_delay: Duration,
    pub backoff: Backoff,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            short_transition_delay: Duration::seconds(30),
            backoff: Backoff::Exponential {
                min: Duration::minutes(1),
                max: Duration::days(1),
            },
        }
    }
}

/// A workflow definition: its states, handlers and settings.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    pub initial_state: String,
    /// Default failure state for states that don't name their own
    pub error_state: String,
    pub settings: WorkflowSettings,
    states: HashMap<String, State>,
}

impl WorkflowDefinition {
    pub fn new(
        workflow_type: impl Into<String>,
        initial_state: impl Into<String>,
        error_state: impl Into<String>,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into().trim().to_string(),
            initial_state: initial_state.into(),
            error_state: error_state.into(),
            settings: WorkflowSettings::default(),
            states: HashMap::new(),
        }
    }

    /// Adds a state, replacing any earlier state with the same name.
    pub fn state(mut self, state: State) -> Self {
        self.states.insert(state.name.clone(), state);
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn get_state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.values()
    }

    pub fn handler_for(&self, state: &str) -> Option<StateHandler> {
        self.states.get(state).and_then(|s| s.handler.clone())
    }

    /// Retry limit of a state, falling back to the workflow setting.
    pub fn max_retries(&self, state: &str) -> u32 {
        self.states
            .get(state)
            .and_then(|s| s.max_retries)
            .unwrap_or(self.settings.max_retries)
    }

    /// Failure state of a state, falling back to the workflow error state.
    pub fn failure_state(&self, state: &str) -> &str {
        self.states
            .get(state)
            .and_then(|s| s.failure_state.as_deref())
            .unwrap_or(&self.error_state)
    }

    /// Returns true if an instance in `state` is never scheduled again.
    pub fn is_final_state(&self, state: &str) -> bool {
        self.states
            .get(state)
            .map(|s| s.state_type.is_final())
            .unwrap_or(false)
    }

    /// Checks that every referenced state exists and working states have handlers.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.workflow_type.is_empty() {
            return Err(DefinitionError::EmptyType);
        }

        let require = |state: &str| {
            if self.states.contains_key(state) {
                Ok(())
            } else {
                Err(DefinitionError::UnknownState {
                    workflow_type: self.workflow_type.clone(),
                    state: state.to_string(),
                })
            }
        };

        require(&self.initial_state)?;
        require(&self.error_state)?;

        for state in self.states.values() {
            if let Some(ref failure) = state.failure_state {
                require(failure)?;
            }
            if !state.state_type.is_final() && state.handler.is_none() {
                return Err(DefinitionError::MissingHandler {
                    workflow_type: self.workflow_type.clone(),
                    state: state.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Dispatch table from workflow type to definition.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a definition.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;

        if self.definitions.contains_key(&definition.workflow_type) {
            return Err(DefinitionError::Duplicate(definition.workflow_type));
        }

        info!(
            "Registered workflow '{}' with {} states",
            definition.workflow_type,
            definition.states.len()
        );
        self.definitions
            .insert(definition.workflow_type.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).cloned()
    }

    pub fn handler_for(&self, workflow_type: &str, state: &str) -> Option<StateHandler> {
        self.definitions
            .get(workflow_type)
            .and_then(|d| d.handler_for(state))
    }

    pub fn max_retries(&self, workflow_type: &str, state: &str) -> Option<u32> {
        self.definitions
            .get(workflow_type)
            .map(|d| d.max_retries(state))
    }

    pub fn failure_state(&self, workflow_type: &str, state: &str) -> Option<String> {
        self.definitions
            .get(workflow_type)
            .map(|d| d.failure_state(state).to_string())
    }

    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut StateExecution) -> Result<(), BoxError> {
        Ok(())
    }

    fn create_test_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("order", "begin", "error")
            .state(State::start("begin").handler(noop))
            .state(
                State::normal("charge")
                    .handler(noop)
                    .max_retries(3)
                    .failure_state("refund"),
            )
            .state(State::normal("refund").handler(noop))
            .state(State::manual("review"))
            .state(State::end("done"))
            .state(State::end("error"))
    }

    #[test]
    fn test_definition_lookup() {
        let definition = create_test_definition();

        assert!(definition.validate().is_ok());
        assert!(definition.has_state("charge"));
        assert!(definition.handler_for("begin").is_some());
        assert!(definition.handler_for("done").is_none());
        assert!(definition.handler_for("missing").is_none());
    }

    #[test]
    fn test_retry_and_failure_fallbacks() {
        let definition = create_test_definition();

        assert_eq!(definition.max_retries("charge"), 3);
        assert_eq!(definition.max_retries("begin"), DEFAULT_MAX_RETRIES);
        assert_eq!(definition.failure_state("charge"), "refund");
        assert_eq!(definition.failure_state("begin"), "error");
    }

    #[test]
    fn test_final_states() {
        let definition = create_test_definition();

        assert!(definition.is_final_state("done"));
        assert!(definition.is_final_state("review"));
        assert!(!definition.is_final_state("begin"));
        assert!(!definition.is_final_state("unknown"));
    }

    #[test]
    fn test_validate_rejects_unknown_error_state() {
        let definition = WorkflowDefinition::new("order", "begin", "error")
            .state(State::start("begin").handler(noop));

        assert_eq!(
            definition.validate(),
            Err(DefinitionError::UnknownState {
                workflow_type: "order".to_string(),
                state: "error".to_string(),
            })
        );
    }

    #[test]
    fn test_validate_rejects_missing_handler() {
        let definition = WorkflowDefinition::new("order", "begin", "error")
            .state(State::start("begin"))
            .state(State::end("error"));

        assert!(matches!(
            definition.validate(),
            Err(DefinitionError::MissingHandler { .. })
        ));
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register(create_test_definition()).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.handler_for("order", "begin").is_some());
        assert!(registry.handler_for("order", "done").is_none());
        assert!(registry.handler_for("invoice", "begin").is_none());
        assert_eq!(registry.max_retries("order", "charge"), Some(3));
        assert_eq!(registry.failure_state("order", "charge").as_deref(), Some("refund"));
        assert_eq!(registry.max_retries("invoice", "begin"), None);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = WorkflowRegistry::new();
        registry.register(create_test_definition()).unwrap();

        let result = registry.register(create_test_definition());
        assert_eq!(result, Err(DefinitionError::Duplicate("order".to_string())));
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            min: Duration::minutes(1),
            max: Duration::minutes(10),
        };

        assert_eq!(backoff.delay(0), Duration::minutes(1));
        assert_eq!(backoff.delay(1), Duration::minutes(2));
        assert_eq!(backoff.delay(3), Duration::minutes(8));
        assert_eq!(backoff.delay(4), Duration::minutes(10));
        assert_eq!(backoff.delay(1000), Duration::minutes(10));
    }

    #[test]
    fn test_exponential_backoff_saturates_near_limit() {
        let max = Duration::milliseconds(i64::MAX);
        let backoff = Backoff::Exponential {
            min: Duration::days(1),
            max,
        };

        assert_eq!(backoff.delay(1), Duration::days(2));
        assert_eq!(backoff.delay(500), max);
        assert_eq!(backoff.delay(u32::MAX), max);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::seconds(5));
        assert_eq!(backoff.delay(0), Duration::seconds(5));
        assert_eq!(backoff.delay(9), Duration::seconds(5));
    }
}
