//! Transition Policy
//!
//! Decides what happens to an instance after one state execution: where it
//! goes next, how its retry counter changes and when it runs again. The
//! decision depends only on the workflow definition, the instance's state
//! before the run, the handler's [`StateOutcome`] and the handler error, so
//! it is a plain function with no I/O.
//!
//! Precedence:
//! 1. A failure (handler error, `failed` flag, missing or unknown next
//!    state) counts against the retry limit and backs off.
//! 2. A retry request runs the same state again after the short delay.
//! 3. Otherwise the instance moves to the requested next state.
//!
//! Exceeding the retry limit routes the instance to the state's failure state.

use chrono::{DateTime, Duration, Utc};

use super::context::StateOutcome;
use crate::workflow::{StateType, WorkflowActionType, WorkflowDefinition, WorkflowInstanceStatus};

/// The decided effect of one state execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next_state: String,
    pub retries: u32,
    pub next_activation: Option<DateTime<Utc>>,
    pub state_text: Option<String>,
    pub status: WorkflowInstanceStatus,
    pub action_type: WorkflowActionType,
}

/// Resolves the transition for a finished state execution.
///
/// `error` carries the message of a handler error, a caught panic or a
/// missing handler.
pub fn resolve(
    definition: &WorkflowDefinition,
    current_state: &str,
    retries: u32,
    outcome: &StateOutcome,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Transition {
    if let Some(reason) = failure_reason(definition, outcome, error) {
        return failed(definition, current_state, retries, outcome, &reason, now);
    }

    if outcome.is_retry {
        return retry(definition, current_state, retries, outcome, now);
    }

    // failure_reason guarantees a known next state here
    let next_state = outcome
        .next_state
        .clone()
        .unwrap_or_else(|| current_state.to_string());
    let retries = if next_state == current_state {
        retries.saturating_add(1)
    } else {
        0
    };
    let next_activation = if definition.is_final_state(&next_state) {
        None
    } else {
        Some(outcome.next_activation.unwrap_or(now))
    };

    Transition {
        status: status_for(definition, &next_state),
        next_state,
        retries,
        next_activation,
        state_text: outcome.next_state_reason.clone(),
        action_type: WorkflowActionType::StateExecution,
    }
}

/// `now + delay`, saturating at the latest representable time.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Status an instance gets when it enters `state`.
pub fn status_for(definition: &WorkflowDefinition, state: &str) -> WorkflowInstanceStatus {
    match definition.get_state(state).map(|s| s.state_type) {
        Some(StateType::End) => WorkflowInstanceStatus::Finished,
        Some(StateType::Manual) => WorkflowInstanceStatus::Manual,
        _ => WorkflowInstanceStatus::InProgress,
    }
}

fn failure_reason(
    definition: &WorkflowDefinition,
    outcome: &StateOutcome,
    error: Option<&str>,
) -> Option<String> {
    if let Some(error) = error {
        return Some(error.to_string());
    }
    if outcome.failed {
        return Some(
            outcome
                .failure_cause
                .clone()
                .unwrap_or_else(|| "State execution failed".to_string()),
        );
    }
    if outcome.is_retry {
        return None;
    }
    match outcome.next_state.as_deref() {
        None => Some("Handler did not set a next state".to_string()),
        Some(state) if !definition.has_state(state) => Some(format!(
            "Unknown next state '{}' for workflow '{}'",
            state, definition.workflow_type
        )),
        Some(_) => None,
    }
}

fn failed(
    definition: &WorkflowDefinition,
    current_state: &str,
    retries: u32,
    outcome: &StateOutcome,
    reason: &str,
    now: DateTime<Utc>,
) -> Transition {
    let attempts = retries.saturating_add(1);
    if outcome.retry_count_exceeded || attempts > definition.max_retries(current_state) {
        return retry_count_exceeded(definition, current_state, attempts, reason, now);
    }

    Transition {
        next_state: current_state.to_string(),
        retries: attempts,
        next_activation: Some(after(now, definition.settings.backoff.delay(retries))),
        state_text: Some(reason.to_string()),
        status: WorkflowInstanceStatus::InProgress,
        action_type: WorkflowActionType::StateExecutionFailed,
    }
}

fn retry(
    definition: &WorkflowDefinition,
    current_state: &str,
    retries: u32,
    outcome: &StateOutcome,
    now: DateTime<Utc>,
) -> Transition {
    let attempts = retries.saturating_add(1);
    if outcome.retry_count_exceeded || attempts > definition.max_retries(current_state) {
        return retry_count_exceeded(
            definition,
            current_state,
            attempts,
            "Retry requested too many times",
            now,
        );
    }

    Transition {
        next_state: current_state.to_string(),
        retries: attempts,
        next_activation: Some(
            outcome
                .next_activation
                .unwrap_or_else(|| after(now, definition.settings.short_transition_delay)),
        ),
        state_text: outcome.next_state_reason.clone(),
        status: WorkflowInstanceStatus::InProgress,
        action_type: WorkflowActionType::StateExecution,
    }
}

fn retry_count_exceeded(
    definition: &WorkflowDefinition,
    current_state: &str,
    attempts: u32,
    reason: &str,
    now: DateTime<Utc>,
) -> Transition {
    let failure_state = definition.failure_state(current_state).to_string();
    let state_text = Some(format!("Max retry count exceeded: {}", reason));

    if failure_state == current_state {
        // Nowhere else to go; park the instance
        return Transition {
            next_state: failure_state,
            retries: attempts,
            next_activation: None,
            state_text,
            status: WorkflowInstanceStatus::InProgress,
            action_type: WorkflowActionType::RetryCountExceeded,
        };
    }

    let next_activation = if definition.is_final_state(&failure_state) {
        None
    } else {
        Some(now)
    };

    Transition {
        status: status_for(definition, &failure_state),
        next_state: failure_state,
        retries: 0,
        next_activation,
        state_text,
        action_type: WorkflowActionType::RetryCountExceeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Backoff, State, WorkflowSettings};
    use chrono::Duration;

    fn create_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("order", "begin", "error")
            .with_settings(WorkflowSettings {
                max_retries: 2,
                short_transition_delay: Duration::seconds(30),
                backoff: Backoff::Exponential {
                    min: Duration::minutes(1),
                    max: Duration::hours(1),
                },
            })
            .state(State::start("begin").handler(|_| Ok(())))
            .state(
                State::normal("charge")
                    .handler(|_| Ok(()))
                    .failure_state("refund"),
            )
            .state(State::normal("refund").handler(|_| Ok(())))
            .state(State::normal("loop").handler(|_| Ok(())).failure_state("loop"))
            .state(State::manual("review"))
            .state(State::end("done"))
            .state(State::end("error"))
    }

    fn moving_to(state: &str) -> StateOutcome {
        StateOutcome {
            next_state: Some(state.to_string()),
            ..StateOutcome::default()
        }
    }

    #[test]
    fn test_state_change_resets_retries() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "begin", 2, &moving_to("charge"), None, now);

        assert_eq!(t.next_state, "charge");
        assert_eq!(t.retries, 0);
        assert_eq!(t.next_activation, Some(now));
        assert_eq!(t.status, WorkflowInstanceStatus::InProgress);
        assert_eq!(t.action_type, WorkflowActionType::StateExecution);
    }

    #[test]
    fn test_same_state_increments_retries() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "charge", 0, &moving_to("charge"), None, now);

        assert_eq!(t.next_state, "charge");
        assert_eq!(t.retries, 1);
    }

    #[test]
    fn test_explicit_activation_is_used() {
        let now = Utc::now();
        let later = now + Duration::hours(2);
        let mut outcome = moving_to("charge");
        outcome.next_activation = Some(later);

        let t = resolve(&create_definition(), "begin", 0, &outcome, None, now);
        assert_eq!(t.next_activation, Some(later));
    }

    #[test]
    fn test_final_states_are_not_activated() {
        let now = Utc::now();
        let definition = create_definition();
        let mut outcome = moving_to("done");
        outcome.next_activation = Some(now);

        let done = resolve(&definition, "charge", 0, &outcome, None, now);
        assert_eq!(done.next_activation, None);
        assert_eq!(done.status, WorkflowInstanceStatus::Finished);

        let review = resolve(&definition, "charge", 0, &moving_to("review"), None, now);
        assert_eq!(review.next_activation, None);
        assert_eq!(review.status, WorkflowInstanceStatus::Manual);
    }

    #[test]
    fn test_handler_error_backs_off() {
        let now = Utc::now();
        let definition = create_definition();

        let first = resolve(&definition, "charge", 0, &StateOutcome::default(), Some("boom"), now);
        assert_eq!(first.next_state, "charge");
        assert_eq!(first.retries, 1);
        assert_eq!(first.next_activation, Some(now + Duration::minutes(1)));
        assert_eq!(first.state_text.as_deref(), Some("boom"));
        assert_eq!(first.action_type, WorkflowActionType::StateExecutionFailed);

        let second = resolve(&definition, "charge", 1, &StateOutcome::default(), Some("boom"), now);
        assert_eq!(second.retries, 2);
        assert_eq!(second.next_activation, Some(now + Duration::minutes(2)));
    }

    #[test]
    fn test_huge_backoff_saturates_activation() {
        let now = Utc::now();
        let definition = create_definition().with_settings(WorkflowSettings {
            max_retries: 2,
            short_transition_delay: Duration::milliseconds(i64::MAX),
            backoff: Backoff::Fixed(Duration::milliseconds(i64::MAX)),
        });

        let backed_off = resolve(&definition, "charge", 0, &StateOutcome::default(), Some("boom"), now);
        assert_eq!(backed_off.next_activation, Some(DateTime::<Utc>::MAX_UTC));

        let retry = StateOutcome {
            is_retry: true,
            ..StateOutcome::default()
        };
        let retried = resolve(&definition, "charge", 0, &retry, None, now);
        assert_eq!(retried.next_activation, Some(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_error_wins_over_next_state() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "charge", 0, &moving_to("done"), Some("boom"), now);
        assert_eq!(t.next_state, "charge");
        assert_eq!(t.retries, 1);
    }

    #[test]
    fn test_failed_flag_counts_as_failure() {
        let now = Utc::now();
        let mut outcome = moving_to("done");
        outcome.failed = true;
        outcome.failure_cause = Some("declined".to_string());

        let t = resolve(&create_definition(), "charge", 0, &outcome, None, now);
        assert_eq!(t.next_state, "charge");
        assert_eq!(t.state_text.as_deref(), Some("declined"));
    }

    #[test]
    fn test_retry_limit_routes_to_failure_state() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "charge", 2, &StateOutcome::default(), Some("boom"), now);

        assert_eq!(t.next_state, "refund");
        assert_eq!(t.retries, 0);
        assert_eq!(t.next_activation, Some(now));
        assert_eq!(t.action_type, WorkflowActionType::RetryCountExceeded);
        assert!(t.state_text.unwrap().contains("boom"));
    }

    #[test]
    fn test_retry_limit_defaults_to_error_state() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "begin", 2, &StateOutcome::default(), Some("boom"), now);

        assert_eq!(t.next_state, "error");
        assert_eq!(t.next_activation, None);
        assert_eq!(t.status, WorkflowInstanceStatus::Finished);
    }

    #[test]
    fn test_self_referencing_failure_state_parks_instance() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "loop", 2, &StateOutcome::default(), Some("boom"), now);

        assert_eq!(t.next_state, "loop");
        assert_eq!(t.retries, 3);
        assert_eq!(t.next_activation, None);
    }

    #[test]
    fn test_retry_request_uses_short_delay() {
        let now = Utc::now();
        let outcome = StateOutcome {
            is_retry: true,
            next_state_reason: Some("not ready".to_string()),
            ..StateOutcome::default()
        };

        let t = resolve(&create_definition(), "charge", 0, &outcome, None, now);
        assert_eq!(t.next_state, "charge");
        assert_eq!(t.retries, 1);
        assert_eq!(t.next_activation, Some(now + Duration::seconds(30)));
        assert_eq!(t.action_type, WorkflowActionType::StateExecution);
        assert_eq!(t.state_text.as_deref(), Some("not ready"));
    }

    #[test]
    fn test_retry_request_respects_limit() {
        let now = Utc::now();
        let outcome = StateOutcome {
            is_retry: true,
            ..StateOutcome::default()
        };

        let t = resolve(&create_definition(), "charge", 2, &outcome, None, now);
        assert_eq!(t.next_state, "refund");
        assert_eq!(t.action_type, WorkflowActionType::RetryCountExceeded);
    }

    #[test]
    fn test_missing_next_state_is_a_failure() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "charge", 0, &StateOutcome::default(), None, now);
        assert_eq!(t.next_state, "charge");
        assert_eq!(t.action_type, WorkflowActionType::StateExecutionFailed);
    }

    #[test]
    fn test_unknown_next_state_is_a_failure() {
        let now = Utc::now();
        let t = resolve(&create_definition(), "charge", 0, &moving_to("nowhere"), None, now);
        assert_eq!(t.next_state, "charge");
        assert!(t.state_text.unwrap().contains("nowhere"));
    }

    #[test]
    fn test_retries_zero_iff_state_changed() {
        let now = Utc::now();
        let definition = create_definition();
        let outcomes = [
            (moving_to("charge"), None),
            (moving_to("done"), None),
            (moving_to("begin"), None),
            (StateOutcome::default(), Some("boom")),
            (
                StateOutcome {
                    is_retry: true,
                    ..StateOutcome::default()
                },
                None,
            ),
        ];

        for (outcome, error) in &outcomes {
            for retries in 0..4 {
                let t = resolve(&definition, "begin", retries, outcome, *error, now);
                assert_eq!(
                    t.retries == 0,
                    t.next_state != "begin",
                    "retries {} -> {:?}",
                    retries,
                    t
                );
            }
        }
    }
}
