//! Workflow Instance Storage
//!
//! The engine owns no persistent state of its own. Everything it knows about
//! an instance comes from an [`InstanceStore`], and every executor run ends in
//! exactly one [`InstanceStore::commit_transition`] call.
//!
//! The store is also the arbiter of ownership: polling claims the returned
//! instances, so no two executors ever work on the same instance at once.
//!
//! # Components
//!
//! - [`InstanceStore`]: contract consumed by the dispatcher and executor
//! - [`InstanceUpdate`]: the atomic write produced by one state transition
//! - [`InMemoryStore`]: process-local implementation

pub mod memory;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::workflow::{
    QueryWorkflowInstances, WorkflowInstance, WorkflowInstanceAction, WorkflowInstanceStatus,
};

pub use memory::InMemoryStore;

/// Everything one executor run writes back, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub state: String,
    pub state_text: Option<String>,
    pub status: WorkflowInstanceStatus,
    pub retries: u32,
    pub next_activation: Option<DateTime<Utc>>,
    /// Full variable map after the handler ran
    pub state_variables: HashMap<String, String>,
    /// Children to create with this instance as their parent, in order
    pub new_children: Vec<WorkflowInstance>,
    /// Parent to schedule for immediate activation
    pub wake_parent: Option<i64>,
    /// History entry for this execution
    pub action: Option<WorkflowInstanceAction>,
    /// Claim the update was produced under, as read by `load_instance`
    pub claim_token: Option<u64>,
}

/// Durable storage of workflow instances.
#[cfg_attr(test, mockall::automock)]
pub trait InstanceStore: Send + Sync {
    /// Claims up to `max_count` instances that are due, in priority order.
    fn poll_next_ready_instance_ids(&self, max_count: usize) -> Result<Vec<i64>, StoreError>;

    /// Loads an instance. A claimed instance carries its claim token.
    fn load_instance(&self, id: i64) -> Result<WorkflowInstance, StoreError>;

    /// Applies a state transition and releases the claim.
    ///
    /// Fails with [`StoreError::Conflict`] unless `update.claim_token` is the
    /// instance's current claim.
    fn commit_transition(&self, id: i64, update: InstanceUpdate) -> Result<(), StoreError>;

    /// Creates new instances, returning their ids in input order.
    fn create_instances(&self, instances: Vec<WorkflowInstance>) -> Result<Vec<i64>, StoreError>;

    fn query_instances(
        &self,
        query: &QueryWorkflowInstances,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;
}
