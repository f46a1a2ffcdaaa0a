//! Status conditions
//!
//! Follows the shape of `metav1.Condition` (type, status, reason, message,
//! lastTransitionTime, observedGeneration) so `kubectl` and other tooling
//! render Butler conditions the same way as built-in ones.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting overall readiness
pub const CONDITION_READY: &str = "Ready";

/// Condition type reporting elastic load-balancer capacity
pub const CONDITION_CAPACITY: &str = "Capacity";

/// Machine-readable condition reasons
pub mod reasons {
    /// Addresses were assigned
    pub const ALLOCATED: &str = "Allocated";
    /// Every candidate pool is out of space (transient)
    pub const POOL_EXHAUSTED: &str = "PoolExhausted";
    /// Allocation failed for an infrastructure or configuration reason
    pub const ALLOCATION_FAILED: &str = "AllocationFailed";
    /// The request itself is malformed
    pub const INVALID_REQUEST: &str = "InvalidRequest";
    /// A pinned range overlaps addresses that are not free
    pub const RANGE_CONFLICT: &str = "RangeConflict";
    /// A pinned range is not inside any candidate pool
    pub const OUT_OF_RANGE: &str = "OutOfRange";
    /// The tenant quota would be exceeded
    pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";
    /// A referenced pool or provider config does not exist
    pub const POOL_NOT_FOUND: &str = "PoolNotFound";
    /// Addresses were returned to the pool
    pub const RELEASED: &str = "Released";
    /// Load-balancer capacity matches demand
    pub const CAPACITY_SUFFICIENT: &str = "CapacitySufficient";
    /// Pool configuration accepted and in use
    pub const POOL_READY: &str = "PoolReady";
    /// Pool configuration was rejected at validation time
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    /// Recorded allocations in the pool collide with each other
    pub const ALLOCATION_CONFLICT: &str = "AllocationConflict";
}

/// Condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The controller cannot tell
    #[default]
    Unknown,
}

/// A single observation about a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, unique within a conditions list
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Machine-readable reason in CamelCase
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,

    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation,
        }
    }
}

/// Insert or update a condition by type.
///
/// `lastTransitionTime` is only moved when the status changes, so repeated
/// reconciliations of the same observation leave the list byte-identical.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        let mut first = Condition::new(CONDITION_READY, ConditionStatus::False, reasons::POOL_EXHAUSTED, "full", Some(1));
        first.last_transition_time -= Duration::minutes(5);
        let original_time = first.last_transition_time;
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, reasons::POOL_EXHAUSTED, "still full", Some(2)),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].message, "still full");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_set_condition_moves_transition_time_on_flip() {
        let mut conditions = Vec::new();
        let mut first = Condition::new(CONDITION_READY, ConditionStatus::False, reasons::POOL_EXHAUSTED, "", None);
        first.last_transition_time -= Duration::minutes(5);
        let original_time = first.last_transition_time;
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True, reasons::ALLOCATED, "", None),
        );

        assert!(conditions[0].last_transition_time > original_time);
        assert_eq!(conditions[0].reason, reasons::ALLOCATED);
    }

    #[test]
    fn test_condition_serializes_like_metav1() {
        let condition = Condition::new(CONDITION_READY, ConditionStatus::True, reasons::ALLOCATED, "ok", None);
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
        assert!(json.get("observedGeneration").is_none());
    }
}
