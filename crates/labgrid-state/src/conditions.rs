//! Named tri-state conditions attached to environments and workers.
//!
//! Conditions are an owned, ordered list on the object's status. There is at
//! most one entry per type, and `last_transition_time` only moves when the
//! status value changes. Setting a condition only mutates the in-memory
//! object; persisting it is the caller's job.

use serde::{Deserialize, Serialize};

use crate::types::{epoch_millis, ProblemEnvironment, Worker};

/// Tri-state value of a condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn is_true(self) -> bool {
        self == ConditionStatus::True
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A single condition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: u64,
    /// Unix timestamp (milliseconds) of the last status change.
    pub last_transition_time: u64,
}

/// A closed set of condition names for one kind of object.
pub trait ConditionType: Copy {
    fn as_str(self) -> &'static str;
}

/// Conditions carried by a problem environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentCondition {
    /// Placement on a worker has been confirmed.
    Scheduled,
    /// The topology has been deployed on the worker.
    Deployed,
    /// Every container of the environment reports ready.
    Ready,
    /// The environment has been handed out to a client.
    Assigned,
}

impl ConditionType for EnvironmentCondition {
    fn as_str(self) -> &'static str {
        match self {
            EnvironmentCondition::Scheduled => "Scheduled",
            EnvironmentCondition::Deployed => "Deployed",
            EnvironmentCondition::Ready => "Ready",
            EnvironmentCondition::Assigned => "Assigned",
        }
    }
}

/// Conditions carried by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerCondition {
    /// The worker's heartbeat lease is current.
    Ready,
}

impl ConditionType for WorkerCondition {
    fn as_str(self) -> &'static str {
        match self {
            WorkerCondition::Ready => "Ready",
        }
    }
}

/// Objects that carry a condition list.
pub trait Conditioned {
    type Condition: ConditionType;

    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn generation(&self) -> u64;
}

impl Conditioned for ProblemEnvironment {
    type Condition = EnvironmentCondition;

    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }

    fn generation(&self) -> u64 {
        self.metadata.generation
    }
}

impl Conditioned for Worker {
    type Condition = WorkerCondition;

    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }

    fn generation(&self) -> u64 {
        self.metadata.generation
    }
}

/// Look up a condition entry by type.
pub fn find_condition<O: Conditioned>(obj: &O, condition: O::Condition) -> Option<&Condition> {
    obj.conditions()
        .iter()
        .find(|c| c.condition_type == condition.as_str())
}

/// Status of a condition, `Unknown` when the object does not carry it.
pub fn get_condition<O: Conditioned>(obj: &O, condition: O::Condition) -> ConditionStatus {
    find_condition(obj, condition)
        .map(|c| c.status)
        .unwrap_or_default()
}

/// Set a condition using the current time. Returns whether the object changed.
pub fn set_condition<O: Conditioned>(
    obj: &mut O,
    condition: O::Condition,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    set_condition_at(obj, condition, status, reason, message, epoch_millis())
}

/// Set a condition as of `now_ms`. Returns whether the object changed.
pub fn set_condition_at<O: Conditioned>(
    obj: &mut O,
    condition: O::Condition,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now_ms: u64,
) -> bool {
    let generation = obj.generation();
    let conditions = obj.conditions_mut();

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.as_str())
    {
        let before = existing.clone();
        if existing.status != status {
            existing.status = status;
            existing.last_transition_time = now_ms;
        }
        existing.observed_generation = generation;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return *existing != before;
    }

    conditions.push(Condition {
        condition_type: condition.as_str().to_string(),
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: now_ms,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_condition_is_unknown() {
        let pe = ProblemEnvironment::default();
        assert_eq!(
            get_condition(&pe, EnvironmentCondition::Ready),
            ConditionStatus::Unknown
        );
    }

    #[test]
    fn set_appends_then_updates_in_place() {
        let mut pe = ProblemEnvironment::default();
        assert!(set_condition_at(
            &mut pe,
            EnvironmentCondition::Scheduled,
            ConditionStatus::False,
            "WorkersMissing",
            "failed to list Workers",
            100,
        ));
        assert!(set_condition_at(
            &mut pe,
            EnvironmentCondition::Scheduled,
            ConditionStatus::True,
            "Scheduled",
            "assigned to Worker",
            200,
        ));

        assert_eq!(pe.status.conditions.len(), 1);
        let c = find_condition(&pe, EnvironmentCondition::Scheduled).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.reason, "Scheduled");
        assert_eq!(c.last_transition_time, 200);
    }

    #[test]
    fn identical_set_is_idempotent() {
        let mut worker = Worker::default();
        set_condition_at(
            &mut worker,
            WorkerCondition::Ready,
            ConditionStatus::True,
            "HealthCheck",
            "checked health",
            100,
        );
        let changed = set_condition_at(
            &mut worker,
            WorkerCondition::Ready,
            ConditionStatus::True,
            "HealthCheck",
            "checked health",
            500,
        );

        assert!(!changed);
        assert_eq!(worker.status.conditions.len(), 1);
        assert_eq!(worker.status.conditions[0].last_transition_time, 100);
    }

    #[test]
    fn reason_change_keeps_transition_time() {
        let mut pe = ProblemEnvironment::default();
        set_condition_at(
            &mut pe,
            EnvironmentCondition::Ready,
            ConditionStatus::False,
            "NotReady",
            "not ready",
            100,
        );
        let changed = set_condition_at(
            &mut pe,
            EnvironmentCondition::Ready,
            ConditionStatus::False,
            "Pending",
            "still pending",
            900,
        );

        assert!(changed);
        let c = find_condition(&pe, EnvironmentCondition::Ready).unwrap();
        assert_eq!(c.reason, "Pending");
        assert_eq!(c.message, "still pending");
        assert_eq!(c.last_transition_time, 100);
    }

    #[test]
    fn observed_generation_tracks_object() {
        let mut pe = ProblemEnvironment::default();
        pe.metadata.generation = 3;
        set_condition(
            &mut pe,
            EnvironmentCondition::Assigned,
            ConditionStatus::False,
            "NotAssigned",
            "",
        );
        assert_eq!(pe.status.conditions[0].observed_generation, 3);

        pe.metadata.generation = 4;
        assert!(set_condition(
            &mut pe,
            EnvironmentCondition::Assigned,
            ConditionStatus::False,
            "NotAssigned",
            "",
        ));
        assert_eq!(pe.status.conditions[0].observed_generation, 4);
    }

    #[test]
    fn conditions_are_independent_per_type() {
        let mut pe = ProblemEnvironment::default();
        set_condition(&mut pe, EnvironmentCondition::Ready, ConditionStatus::True, "Ready", "");
        set_condition(
            &mut pe,
            EnvironmentCondition::Assigned,
            ConditionStatus::False,
            "NotAssigned",
            "",
        );

        assert!(get_condition(&pe, EnvironmentCondition::Ready).is_true());
        assert_eq!(get_condition(&pe, EnvironmentCondition::Assigned), ConditionStatus::False);
        assert_eq!(get_condition(&pe, EnvironmentCondition::Deployed), ConditionStatus::Unknown);
    }
}
