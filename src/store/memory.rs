//! In-memory Instance Store
//!
//! A process-local [`InstanceStore`] guarded by a single lock, so every
//! operation is atomic. Polling claims instances; claims older than the
//! configured timeout are taken over by the next poll, which is how
//! instances held by a crashed or stuck executor get picked up again. Every
//! claim gets a fresh token, and only the holder of the current token may
//! commit.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{InstanceStore, InstanceUpdate};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::workflow::{QueryWorkflowInstances, WorkflowInstance, WorkflowInstanceStatus};

#[derive(Debug, Clone)]
struct StoredInstance {
    instance: WorkflowInstance,
    claimed_at: Option<DateTime<Utc>>,
    claim_token: Option<u64>,
    /// A child asked for a wake-up while this instance was claimed
    wake_pending: bool,
}

#[derive(Debug, Default)]
struct Inner {
    instances: BTreeMap<i64, StoredInstance>,
    next_id: i64,
    next_claim_token: u64,
}

impl Inner {
    fn check_duplicates(&self, candidates: &[WorkflowInstance]) -> Result<(), StoreError> {
        let mut seen: HashSet<(&str, &str)> = self
            .instances
            .values()
            .filter_map(|s| {
                s.instance
                    .external_id
                    .as_deref()
                    .map(|ext| (s.instance.workflow_type.as_str(), ext))
            })
            .collect();

        for candidate in candidates {
            if let Some(ext) = candidate.external_id.as_deref() {
                if !seen.insert((candidate.workflow_type.as_str(), ext)) {
                    return Err(StoreError::Duplicate {
                        workflow_type: candidate.workflow_type.clone(),
                        external_id: ext.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Inserts an instance that already passed the duplicate check.
    fn insert(&mut self, mut instance: WorkflowInstance, now: DateTime<Utc>) -> i64 {
        self.next_id += 1;
        let id = self.next_id;

        instance.id = Some(id);
        instance.created = Some(now);
        instance.modified = Some(now);
        instance.actions.clear();
        instance.claim_token = None;

        self.instances.insert(
            id,
            StoredInstance {
                instance,
                claimed_at: None,
                claim_token: None,
                wake_pending: false,
            },
        );
        id
    }
}

/// Thread-safe in-memory workflow instance store.
///
/// # Example
///
/// ```
/// use flowrunner::store::{InMemoryStore, InstanceStore};
/// use flowrunner::workflow::WorkflowInstance;
///
/// let store = InMemoryStore::new();
/// let ids = store
///     .create_instances(vec![WorkflowInstance::builder("order").state("begin").build()])
///     .unwrap();
/// assert_eq!(store.load_instance(ids[0]).unwrap().state, "begin");
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    claim_timeout: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_config(&StoreConfig::default())
    }

    pub fn with_config(config: &StoreConfig) -> Self {
        let claim_timeout =
            Duration::from_std(config.claim_timeout).unwrap_or_else(|_| Duration::days(365));
        Self {
            inner: Mutex::new(Inner::default()),
            claim_timeout,
        }
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.inner.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the instance is currently claimed by an executor.
    pub fn is_claimed(&self, id: i64) -> bool {
        self.inner
            .lock()
            .instances
            .get(&id)
            .map_or(false, |s| s.claimed_at.is_some())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceStore for InMemoryStore {
    fn poll_next_ready_instance_ids(&self, max_count: usize) -> Result<Vec<i64>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut inner = self.inner.lock();

        let mut ready: Vec<(DateTime<Utc>, i64)> = Vec::new();
        for (id, stored) in &inner.instances {
            let Some(activation) = stored.instance.next_activation else {
                continue;
            };
            if activation > now {
                continue;
            }
            match stored.claimed_at {
                None => ready.push((activation, *id)),
                Some(claimed_at) if claimed_at + self.claim_timeout <= now => {
                    warn!(
                        "Claim on workflow instance {} expired (claimed at {}), reclaiming",
                        id, claimed_at
                    );
                    ready.push((activation, *id));
                }
                Some(_) => {}
            }
        }

        ready.sort();
        ready.truncate(max_count);

        let ids: Vec<i64> = ready.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            inner.next_claim_token += 1;
            let token = inner.next_claim_token;
            if let Some(stored) = inner.instances.get_mut(id) {
                stored.claimed_at = Some(now);
                stored.claim_token = Some(token);
                stored.instance.status = WorkflowInstanceStatus::Executing;
            }
        }

        if !ids.is_empty() {
            debug!("Claimed workflow instances {:?}", ids);
        }
        Ok(ids)
    }

    fn load_instance(&self, id: i64) -> Result<WorkflowInstance, StoreError> {
        self.inner
            .lock()
            .instances
            .get(&id)
            .map(|s| {
                let mut instance = s.instance.clone();
                instance.claim_token = s.claim_token;
                instance
            })
            .ok_or(StoreError::NotFound(id))
    }

    fn commit_transition(&self, id: i64, update: InstanceUpdate) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        match inner.instances.get(&id) {
            None => return Err(StoreError::NotFound(id)),
            Some(stored)
                if stored.claimed_at.is_none() || stored.claim_token != update.claim_token =>
            {
                warn!(
                    "Rejected commit on workflow instance {} without its current claim",
                    id
                );
                return Err(StoreError::Conflict(id));
            }
            Some(_) => {}
        }

        // Validate everything before the first write
        inner.check_duplicates(&update.new_children)?;

        let InstanceUpdate {
            state,
            state_text,
            status,
            retries,
            next_activation,
            state_variables,
            new_children,
            wake_parent,
            action,
            ..
        } = update;

        if let Some(stored) = inner.instances.get_mut(&id) {
            let instance = &mut stored.instance;
            instance.state = state;
            instance.state_text = state_text;
            instance.status = status;
            instance.retries = retries;
            // A wake-up that arrived mid-execution must not be overwritten
            instance.next_activation = match next_activation {
                Some(at) if stored.wake_pending => Some(at.min(now)),
                other => other,
            };
            instance.state_variables = state_variables;
            instance.modified = Some(now);
            if let Some(action) = action {
                instance.actions.push(action);
            }
            stored.claimed_at = None;
            stored.claim_token = None;
            stored.wake_pending = false;
        }

        for mut child in new_children {
            child.parent_workflow_id = Some(id);
            let child_id = inner.insert(child, now);
            debug!("Created child workflow {} of instance {}", child_id, id);
        }

        if let Some(parent_id) = wake_parent {
            match inner.instances.get_mut(&parent_id) {
                Some(parent)
                    if matches!(
                        parent.instance.status,
                        WorkflowInstanceStatus::Finished | WorkflowInstanceStatus::Manual
                    ) =>
                {
                    debug!(
                        "Parent workflow {} of instance {} is in final state '{}', not waking it up",
                        parent_id, id, parent.instance.state
                    );
                }
                Some(parent) => {
                    parent.instance.next_activation = Some(now);
                    parent.instance.modified = Some(now);
                    parent.wake_pending = parent.claimed_at.is_some();
                    debug!("Woke up parent workflow {} of instance {}", parent_id, id);
                }
                None => warn!(
                    "Parent workflow {} of instance {} does not exist",
                    parent_id, id
                ),
            }
        }

        Ok(())
    }

    fn create_instances(&self, instances: Vec<WorkflowInstance>) -> Result<Vec<i64>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        inner.check_duplicates(&instances)?;

        let ids: Vec<i64> = instances
            .into_iter()
            .map(|instance| inner.insert(instance, now))
            .collect();

        info!("Created {} workflow instances", ids.len());
        Ok(ids)
    }

    fn query_instances(
        &self,
        query: &QueryWorkflowInstances,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let inner = self.inner.lock();

        let limit = query.max_results.unwrap_or(usize::MAX);
        let results = inner
            .instances
            .values()
            .filter(|s| query.matches(&s.instance))
            .take(limit)
            .map(|s| {
                let mut instance = s.instance.clone();
                if !query.include_actions {
                    instance.actions.clear();
                }
                instance
            })
            .collect();

        Ok(results)
    }
}
