//! Remediation controller
//!
//! Third stage: a drained event with an actionable recommendation gets
//! exactly one RebootNode side-effect record. The actual reboot executor is
//! external; this controller only creates the record and watches its status
//! phase. Events recommending NoAction or ContactSupport stay at `Drained`
//! until an operator steps in.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::controllers::{record_err, Outcome, Reconcile};
use crate::error::ControllerError;
use crate::event::{
    reason, ConditionStatus, ConditionType, RebootNode, RebootPhase,
};
use crate::phase::EventPhase;
use crate::records::{RecordStore, StatusUpdate};

/// How often to poll an in-flight RebootNode.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct RemediationController {
    records: RecordStore,
    metrics: crate::metrics::RemediationMetrics,
    poll_interval: Duration,
}

impl RemediationController {
    pub fn new(records: RecordStore, metrics: crate::metrics::RemediationMetrics) -> Self {
        Self {
            records,
            metrics,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Shorten the completion poll, for tests.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn reboot_name(uid: &str) -> String {
        format!("reboot-{}", uid)
    }

    fn set_skipped(&self, event_name: &str, message: &str) -> Result<(), ControllerError> {
        self.records
            .update_event_status(event_name, |e| {
                if e.status.phase != EventPhase::Drained {
                    return StatusUpdate::Abort;
                }
                // Terminal for this controller; re-applying is a no-op
                e.status.set_condition(
                    ConditionType::Remediated,
                    ConditionStatus::False,
                    reason::SKIPPED,
                    message,
                    Utc::now(),
                );
                StatusUpdate::Apply
            })
            .map_err(record_err)?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile for RemediationController {
    fn name(&self) -> &'static str {
        "remediation"
    }

    async fn reconcile(&self, event_name: &str) -> Result<Outcome, ControllerError> {
        let event = match self.records.get_event(event_name) {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => return Err(record_err(e)),
        };

        if event.status.phase != EventPhase::Drained {
            return Ok(Outcome::Done);
        }

        let node = event.spec.node_name.clone();
        let action = event.spec.recommended_action;

        if !event.spec.is_fatal
            || action.requires_operator()
            || event.spec.overrides.remediation.skip
        {
            let message = if !event.spec.is_fatal {
                "event is not fatal".to_string()
            } else if event.spec.overrides.remediation.skip {
                "remediation skipped by override".to_string()
            } else {
                format!("recommended action {} requires an operator", action)
            };
            self.set_skipped(event_name, &message)?;
            return Ok(Outcome::Done);
        }

        // A previously failed reboot is terminal; do not create another.
        if let Some(cond) = event.status.condition(ConditionType::Remediated) {
            if cond.status == ConditionStatus::False && cond.reason == reason::FAILED {
                return Ok(Outcome::Done);
            }
        }

        let reboot_name = Self::reboot_name(&event.metadata.uid);

        let reboot = match self.records.get_reboot(&reboot_name) {
            Ok(reboot) => reboot,
            Err(e) if e.is_not_found() => {
                let mut reboot = RebootNode::default();
                reboot.metadata.name = reboot_name.clone();
                reboot.spec.node_name = node.clone();
                reboot.spec.owning_health_event_uid = event.metadata.uid.clone();
                reboot.spec.created_at = Some(Utc::now());

                match self.records.create_reboot(&mut reboot) {
                    Ok(()) => {
                        info!(event = %event_name, node = %node, reboot = %reboot_name, "RebootNode created");
                        self.metrics
                            .actions
                            .with_label_values(&[node.as_str(), action.to_string().as_str()])
                            .inc();
                    }
                    // Lost the race against our own earlier attempt
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(record_err(e)),
                }

                self.records
                    .update_event_status(event_name, |e| {
                        if e.status.phase != EventPhase::Drained {
                            return StatusUpdate::Abort;
                        }
                        e.status.set_condition(
                            ConditionType::Remediated,
                            ConditionStatus::Unknown,
                            reason::IN_PROGRESS,
                            "waiting for node reboot",
                            Utc::now(),
                        );
                        StatusUpdate::Apply
                    })
                    .map_err(record_err)?;

                return Ok(Outcome::RequeueAfter(self.poll_interval));
            }
            Err(e) => return Err(record_err(e)),
        };

        match reboot.status.phase {
            RebootPhase::Completed => {
                self.records
                    .update_event_status(event_name, |e| {
                        if e.status.phase != EventPhase::Drained {
                            return StatusUpdate::Abort;
                        }
                        e.status.set_condition(
                            ConditionType::Remediated,
                            ConditionStatus::True,
                            reason::REBOOT_COMPLETED,
                            "node reboot completed",
                            Utc::now(),
                        );
                        e.status.phase = EventPhase::Remediated;
                        StatusUpdate::Apply
                    })
                    .map_err(record_err)?;

                info!(event = %event_name, node = %node, "Remediation completed");
                Ok(Outcome::Done)
            }
            RebootPhase::Failed => {
                warn!(event = %event_name, node = %node, "Node reboot failed; operator attention required");
                self.records
                    .update_event_status(event_name, |e| {
                        if e.status.phase != EventPhase::Drained {
                            return StatusUpdate::Abort;
                        }
                        e.status.set_condition(
                            ConditionType::Remediated,
                            ConditionStatus::False,
                            reason::FAILED,
                            "node reboot failed",
                            Utc::now(),
                        );
                        StatusUpdate::Apply
                    })
                    .map_err(record_err)?;

                self.metrics
                    .failures
                    .with_label_values(&[node.as_str(), action.to_string().as_str()])
                    .inc();
                Ok(Outcome::Done)
            }
            RebootPhase::Pending | RebootPhase::InProgress => {
                Ok(Outcome::RequeueAfter(self.poll_interval))
            }
        }
    }
}
