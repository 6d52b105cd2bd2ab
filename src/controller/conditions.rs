//! Condition management helpers following Kubernetes API conventions

use crate::crd::{Condition, RemoteObjectStatus};

/// Condition types reported on every managed resource
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_FAILED: &str = "Failed";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";
pub const CONDITION_TYPE_CONFLICT: &str = "Conflict";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Condition reasons
pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_IN_SYNC: &str = "InSync";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_AUTH_FAILURE: &str = "AuthFailure";
pub const REASON_TRANSIENT_ERROR: &str = "TransientError";
pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";
pub const REASON_CONFLICT_DETECTED: &str = "ConflictDetected";
pub const REASON_RESOLVED: &str = "Resolved";

/// Replace the condition of the same type, or append it
///
/// `lastTransitionTime` moves only when the status value flips; reason,
/// message and observed generation always take the new values. Conditions
/// of other types are left untouched.
pub fn upsert_condition(status: &mut RemoteObjectStatus, condition: Condition) {
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == condition.type_)
    {
        if existing.status != condition.status {
            existing.last_transition_time = condition.last_transition_time;
        }
        existing.status = condition.status;
        existing.reason = condition.reason;
        existing.message = condition.message;
        existing.observed_generation = condition.observed_generation;
    } else {
        status.conditions.push(condition);
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Flip a condition to False if it is currently True; absent types stay absent
pub fn clear_condition(
    status: &mut RemoteObjectStatus,
    type_: &str,
    generation: Option<i64>,
    message: &str,
) {
    if is_condition_true(&status.conditions, type_) {
        upsert_condition(
            status,
            Condition::new(type_, CONDITION_STATUS_FALSE, REASON_RESOLVED, message)
                .with_generation(generation),
        );
    }
}

pub fn ready_condition(reason: &str, message: &str) -> Condition {
    Condition::new(CONDITION_TYPE_READY, CONDITION_STATUS_TRUE, reason, message)
}

pub fn not_ready_condition(reason: &str, message: &str) -> Condition {
    Condition::new(CONDITION_TYPE_READY, CONDITION_STATUS_FALSE, reason, message)
}

pub fn failed_condition(reason: &str, message: &str) -> Condition {
    Condition::new(CONDITION_TYPE_FAILED, CONDITION_STATUS_TRUE, reason, message)
}

pub fn not_progressing_condition(reason: &str, message: &str) -> Condition {
    Condition::new(
        CONDITION_TYPE_PROGRESSING,
        CONDITION_STATUS_FALSE,
        reason,
        message,
    )
}

pub fn degraded_condition(reason: &str, message: &str) -> Condition {
    Condition::new(CONDITION_TYPE_DEGRADED, CONDITION_STATUS_TRUE, reason, message)
}

pub fn conflict_condition(message: &str) -> Condition {
    Condition::new(
        CONDITION_TYPE_CONFLICT,
        CONDITION_STATUS_TRUE,
        REASON_CONFLICT_DETECTED,
        message,
    )
}

/// True when a `Failed` condition was recorded against this exact generation
pub fn failed_for_generation(conditions: &[Condition], generation: Option<i64>) -> bool {
    find_condition(conditions, CONDITION_TYPE_FAILED)
        .map(|c| c.status == CONDITION_STATUS_TRUE && c.observed_generation == generation)
        .unwrap_or(false)
}
