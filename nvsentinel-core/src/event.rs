//! Cluster-scoped record types
//!
//! HealthEvent is the record representing one detected fault lifecycle;
//! RebootNode is the side-effect record the remediation controller creates
//! and an external executor completes. Wire encoding is self-describing
//! JSON with lowerCamelCase field names; unknown fields are preserved on
//! round-trip through the flattened maps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::phase::EventPhase;

/// Condition reasons written by the controllers.
pub mod reason {
    pub const SKIPPED: &str = "Skipped";
    pub const NODE_CORDONED: &str = "NodeCordoned";
    pub const NODE_MISSING: &str = "NodeMissing";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const BLOCKED: &str = "Blocked";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const REBOOT_COMPLETED: &str = "RebootCompleted";
    pub const HEALTHY_SIGNAL: &str = "HealthySignalReceived";
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Minimal object metadata: stable name, uid assigned on creation, and the
/// store revision of the last read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Monotonically increasing per-object revision. Maintained by the
    /// record store; cleared before encoding so the store revision is the
    /// single source of truth.
    #[serde(skip_serializing_if = "is_zero")]
    pub resource_version: u64,
}

/// Which remediation the producer recommends for a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecommendedAction {
    #[default]
    NoAction,
    #[serde(rename = "RestartVM")]
    RestartVm,
    #[serde(rename = "ResetGPU")]
    ResetGpu,
    ContactSupport,
}

impl RecommendedAction {
    /// True when the pipeline must stop before remediation and wait for an
    /// operator.
    pub fn requires_operator(self) -> bool {
        matches!(
            self,
            RecommendedAction::NoAction | RecommendedAction::ContactSupport
        )
    }
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecommendedAction::NoAction => write!(f, "NoAction"),
            RecommendedAction::RestartVm => write!(f, "RestartVM"),
            RecommendedAction::ResetGpu => write!(f, "ResetGPU"),
            RecommendedAction::ContactSupport => write!(f, "ContactSupport"),
        }
    }
}

/// Per-stage skip flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipFlag {
    pub skip: bool,
}

/// Producer-supplied pipeline overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Overrides {
    pub quarantine: SkipFlag,
    pub drain: SkipFlag,
    pub remediation: SkipFlag,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        *self == Overrides::default()
    }
}

/// HealthEvent spec: immutable after creation except by the publisher.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthEventSpec {
    /// Producer identity
    pub source: String,

    /// Node the event pertains to
    pub node_name: String,

    /// e.g. "GPU"
    #[serde(skip_serializing_if = "String::is_empty")]
    pub component_class: String,

    /// Which detector fired
    pub check_name: String,

    /// True means the event is driven through the pipeline
    pub is_fatal: bool,

    /// True means the producer observed recovery
    pub is_healthy: bool,

    /// Ordered, de-duplicated device error codes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub error_codes: Vec<u64>,

    pub recommended_action: RecommendedAction,

    #[serde(skip_serializing_if = "Overrides::is_empty")]
    pub overrides: Overrides,

    /// Wall-clock instant the producer observed the fault
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// Named condition types, each owned by exactly one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    NodeQuarantined,
    PodsDrained,
    Remediated,
    Resolved,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::NodeQuarantined => write!(f, "NodeQuarantined"),
            ConditionType::PodsDrained => write!(f, "PodsDrained"),
            ConditionType::Remediated => write!(f, "Remediated"),
            ConditionType::Resolved => write!(f, "Resolved"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One condition entry; at most one per type on a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// HealthEvent status: mutated only through the status update path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthEventStatus {
    pub phase: EventPhase,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Set exactly when phase is Resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Bumped on every status write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl HealthEventStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Set or refresh a condition. `lastTransitionTime` moves only when the
    /// status value actually changes; reason and message are always updated.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            return;
        }

        self.conditions.push(Condition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        });
    }
}

/// The record representing one detected fault lifecycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthEvent {
    pub metadata: ObjectMeta,
    pub spec: HealthEventSpec,
    pub status: HealthEventStatus,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl HealthEvent {
    /// True until the event reaches its terminal phase.
    pub fn is_open(&self) -> bool {
        !self.status.phase.is_terminal()
    }

    /// Move the event to Resolved with the owning condition and timestamp.
    pub fn mark_resolved(&mut self, message: &str, now: DateTime<Utc>) {
        self.status.phase = EventPhase::Resolved;
        self.status.resolved_at = Some(now);
        self.status.set_condition(
            ConditionType::Resolved,
            ConditionStatus::True,
            reason::HEALTHY_SIGNAL,
            message,
            now,
        );
    }
}

/// RebootNode side-effect phases; the executor is external, the remediation
/// controller only observes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebootPhase {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for RebootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebootPhase::Pending => write!(f, "Pending"),
            RebootPhase::InProgress => write!(f, "InProgress"),
            RebootPhase::Completed => write!(f, "Completed"),
            RebootPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebootNodeSpec {
    pub node_name: String,

    #[serde(rename = "owningHealthEventUID")]
    pub owning_health_event_uid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebootNodeStatus {
    pub phase: RebootPhase,
}

/// Side-effect record whose completion signals successful remediation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebootNode {
    pub metadata: ObjectMeta,
    pub spec: RebootNodeSpec,
    pub status: RebootNodeStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_set_condition_transition_time_only_moves_on_change() {
        let mut status = HealthEventStatus::default();

        status.set_condition(
            ConditionType::PodsDrained,
            ConditionStatus::Unknown,
            reason::IN_PROGRESS,
            "3 pods remaining",
            t(100),
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, t(100));

        // Same status, later write: reason/message refresh, timestamp stays
        status.set_condition(
            ConditionType::PodsDrained,
            ConditionStatus::Unknown,
            reason::IN_PROGRESS,
            "1 pod remaining",
            t(200),
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, t(100));
        assert_eq!(status.conditions[0].message, "1 pod remaining");

        // Status flips: timestamp moves
        status.set_condition(
            ConditionType::PodsDrained,
            ConditionStatus::True,
            reason::COMPLETED,
            "",
            t(300),
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, t(300));
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_condition_types_are_unique() {
        let mut status = HealthEventStatus::default();
        for _ in 0..3 {
            status.set_condition(
                ConditionType::NodeQuarantined,
                ConditionStatus::True,
                reason::NODE_CORDONED,
                "",
                t(1),
            );
        }
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_mark_resolved() {
        let mut event = HealthEvent::default();
        assert!(event.is_open());

        event.mark_resolved("healthy signal from producer", t(500));

        assert!(!event.is_open());
        assert_eq!(event.status.phase, EventPhase::Resolved);
        assert_eq!(event.status.resolved_at, Some(t(500)));
        let cond = event.status.condition(ConditionType::Resolved).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, reason::HEALTHY_SIGNAL);
    }

    #[test]
    fn test_wire_field_names() {
        let mut event = HealthEvent::default();
        event.metadata.name = "n1-xid-abc".into();
        event.spec.node_name = "n1".into();
        event.spec.is_fatal = true;
        event.spec.error_codes = vec![79];
        event.spec.recommended_action = RecommendedAction::RestartVm;

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["spec"]["nodeName"], "n1");
        assert_eq!(value["spec"]["isFatal"], true);
        assert_eq!(value["spec"]["recommendedAction"], "RestartVM");
        assert_eq!(value["status"]["phase"], "");
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let wire = serde_json::json!({
            "metadata": { "name": "ev-1", "uid": "u-1" },
            "spec": {
                "source": "e2e",
                "nodeName": "n1",
                "checkName": "GpuXidError",
                "isFatal": true,
                "isHealthy": false,
                "errorCodes": [79],
                "recommendedAction": "RestartVM",
                "futureSpecField": { "nested": 1 }
            },
            "status": {
                "phase": "Quarantined",
                "futureStatusField": "x"
            },
            "futureTopLevel": [1, 2, 3]
        });

        let event: HealthEvent = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(event.spec.unknown["futureSpecField"]["nested"], 1);
        assert_eq!(event.status.unknown["futureStatusField"], "x");
        assert_eq!(event.unknown["futureTopLevel"][0], 1);

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["spec"]["futureSpecField"], wire["spec"]["futureSpecField"]);
        assert_eq!(back["status"]["futureStatusField"], "x");
        assert_eq!(back["futureTopLevel"], wire["futureTopLevel"]);
        assert_eq!(back["spec"]["nodeName"], "n1");
    }

    #[test]
    fn test_reboot_node_round_trip() {
        let reboot = RebootNode {
            metadata: ObjectMeta {
                name: "reboot-u-1".into(),
                ..Default::default()
            },
            spec: RebootNodeSpec {
                node_name: "n1".into(),
                owning_health_event_uid: "u-1".into(),
                created_at: Some(t(42)),
            },
            status: RebootNodeStatus {
                phase: RebootPhase::InProgress,
            },
        };

        let value = serde_json::to_value(&reboot).unwrap();
        assert_eq!(value["spec"]["owningHealthEventUID"], "u-1");
        assert_eq!(value["status"]["phase"], "InProgress");

        let back: RebootNode = serde_json::from_value(value).unwrap();
        assert_eq!(back, reboot);
    }
}
