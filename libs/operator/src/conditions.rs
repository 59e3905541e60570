use std::fmt;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";
pub const PROGRESSING: &str = "Progressing";
pub const DEGRADED: &str = "Degraded";
pub const BENCH_READY: &str = "BenchReady";
pub const DATABASE_READY: &str = "DatabaseReady";
pub const TERMINATING: &str = "Terminating";

/// Coarse lifecycle state shared by every managed kind.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Failed,
    Terminating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Provisioning => "Provisioning",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
            Phase::Terminating => "Terminating",
        };
        write!(f, "{s}")
    }
}

/// Build a condition stamped with the object generation it was computed from.
pub fn condition(
    generation: Option<i64>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Upsert `next` into the condition set. `lastTransitionTime` is carried over
/// from the current entry unless the status actually changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(current) => {
            if current.status == next.status {
                next.last_transition_time = current.last_transition_time.clone();
            }
            *current = next;
        }
        None => conditions.push(next),
    }
}

pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            condition(Some(1), READY, false, "Provisioning", "children pending"),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            condition(Some(2), READY, false, "Provisioning", "still pending"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].observed_generation, Some(2));
        assert_eq!(conditions[0].message, "still pending");
    }

    #[test]
    fn upsert_bumps_transition_time_on_status_change() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            condition(Some(1), READY, false, "Provisioning", ""),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        // The clock has nanosecond resolution; any flip gets a fresh stamp
        // unless the two writes land on the same instant.
        std::thread::sleep(std::time::Duration::from_millis(2));
        set_condition(&mut conditions, condition(Some(1), READY, true, "Ready", ""));
        assert_eq!(conditions[0].status, "True");
        assert_ne!(conditions[0].last_transition_time, first_transition);
    }

    #[test]
    fn distinct_types_accumulate() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition(Some(1), READY, true, "Ready", ""));
        set_condition(
            &mut conditions,
            condition(Some(1), PROGRESSING, false, "Stable", ""),
        );
        assert_eq!(conditions.len(), 2);
        assert!(is_true(&conditions, READY));
        assert!(!is_true(&conditions, PROGRESSING));
        assert!(!is_true(&conditions, DEGRADED));
    }
}
