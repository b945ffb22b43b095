//! Preprocessing of new workflow instances
//!
//! Child workflows created by a handler are completed and validated here
//! before they are queued for creation.

use std::sync::Arc;

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use super::definition::WorkflowRegistry;
use super::instance::{WorkflowInstance, WorkflowInstanceStatus};
use crate::error::ContextError;

/// Finalizes a candidate instance before it is created.
pub trait ChildPreprocessor: Send + Sync {
    fn process(&self, instance: WorkflowInstance) -> Result<WorkflowInstance, ContextError>;
}

/// Fills in defaults from the registered workflow definition.
///
/// - rejects unknown workflow types and unknown states
/// - defaults the state to the definition's initial state
/// - assigns a random external id when none was given
/// - schedules the instance to run immediately unless an activation was set
#[derive(Debug, Clone)]
pub struct DefaultChildPreprocessor {
    registry: Arc<WorkflowRegistry>,
}

impl DefaultChildPreprocessor {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self { registry }
    }
}

impl ChildPreprocessor for DefaultChildPreprocessor {
    fn process(&self, mut instance: WorkflowInstance) -> Result<WorkflowInstance, ContextError> {
        let definition = self.registry.definition(&instance.workflow_type).ok_or_else(|| {
            ContextError::Preprocess(format!(
                "no workflow definition found for type '{}'",
                instance.workflow_type
            ))
        })?;

        if instance.state.trim().is_empty() {
            instance.state = definition.initial_state.clone();
        } else if !definition.has_state(&instance.state) {
            return Err(ContextError::Preprocess(format!(
                "workflow '{}' has no state '{}'",
                instance.workflow_type, instance.state
            )));
        }

        if instance.external_id.as_deref().map_or(true, str::is_empty) {
            instance.external_id = Some(Uuid::new_v4().to_string());
        }

        if instance.next_activation.is_none() {
            instance.next_activation = Some(Utc::now());
        }

        instance.id = None;
        instance.status = WorkflowInstanceStatus::Created;
        instance.retries = 0;

        debug!(
            "Prepared child workflow '{}' in state '{}'",
            instance.workflow_type, instance.state
        );
        Ok(instance)
    }
}
