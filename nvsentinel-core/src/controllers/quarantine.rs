//! Quarantine controller
//!
//! First stage of the pipeline: a new fatal HealthEvent gets its node
//! cordoned and moves to `Quarantined`. Non-fatal events and events with the
//! quarantine skip override move to `Quarantined` without touching the node,
//! so downstream controllers always see a consistent starting phase.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::controllers::{record_err, NodeAdmin, NodeOpError, Outcome, Reconcile};
use crate::error::ControllerError;
use crate::event::{reason, ConditionStatus, ConditionType};
use crate::phase::EventPhase;
use crate::records::{RecordStore, StatusUpdate};

pub struct QuarantineController {
    records: RecordStore,
    nodes: Arc<dyn NodeAdmin>,
    metrics: crate::metrics::QuarantineMetrics,
}

impl QuarantineController {
    pub fn new(
        records: RecordStore,
        nodes: Arc<dyn NodeAdmin>,
        metrics: crate::metrics::QuarantineMetrics,
    ) -> Self {
        Self {
            records,
            nodes,
            metrics,
        }
    }

    fn count(&self, node: &str, outcome: &str) {
        self.metrics.actions.with_label_values(&[node, outcome]).inc();
    }
}

#[async_trait]
impl Reconcile for QuarantineController {
    fn name(&self) -> &'static str {
        "quarantine"
    }

    async fn reconcile(&self, event_name: &str) -> Result<Outcome, ControllerError> {
        let event = match self.records.get_event(event_name) {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => return Err(record_err(e)),
        };

        if event.status.phase != EventPhase::New {
            return Ok(Outcome::Done);
        }

        let node = event.spec.node_name.clone();

        if !event.spec.is_fatal || event.spec.overrides.quarantine.skip {
            let message = if event.spec.is_fatal {
                "quarantine skipped by override"
            } else {
                "event is not fatal"
            };

            self.records
                .update_event_status(event_name, |e| {
                    if e.status.phase != EventPhase::New {
                        return StatusUpdate::Abort;
                    }
                    e.status.set_condition(
                        ConditionType::NodeQuarantined,
                        ConditionStatus::False,
                        reason::SKIPPED,
                        message,
                        Utc::now(),
                    );
                    e.status.phase = EventPhase::Quarantined;
                    StatusUpdate::Apply
                })
                .map_err(record_err)?;

            self.count(&node, "skipped");
            return Ok(Outcome::Done);
        }

        match self.nodes.cordon(&node).await {
            Ok(()) => {
                self.records
                    .update_event_status(event_name, |e| {
                        if e.status.phase != EventPhase::New {
                            return StatusUpdate::Abort;
                        }
                        e.status.set_condition(
                            ConditionType::NodeQuarantined,
                            ConditionStatus::True,
                            reason::NODE_CORDONED,
                            "node marked unschedulable",
                            Utc::now(),
                        );
                        e.status.phase = EventPhase::Quarantined;
                        StatusUpdate::Apply
                    })
                    .map_err(record_err)?;

                info!(event = %event_name, node = %node, "Node quarantined");
                self.count(&node, "success");
                Ok(Outcome::Done)
            }
            Err(NodeOpError::NotFound(_)) => {
                warn!(event = %event_name, node = %node, "Quarantine target node missing");
                self.records
                    .update_event_status(event_name, |e| {
                        if e.status.phase != EventPhase::New {
                            return StatusUpdate::Abort;
                        }
                        e.status.set_condition(
                            ConditionType::NodeQuarantined,
                            ConditionStatus::False,
                            reason::NODE_MISSING,
                            "node not found",
                            Utc::now(),
                        );
                        StatusUpdate::Apply
                    })
                    .map_err(record_err)?;

                self.count(&node, "failed");
                Ok(Outcome::Requeue)
            }
            Err(NodeOpError::Transient(msg)) => {
                self.count(&node, "failed");
                Err(ControllerError::Transient(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::fake::{fatal_event, FakeCluster};
    use crate::metrics::QuarantineMetrics;
    use crate::store::MemoryStore;
    use prometheus::Registry;

    fn setup(cluster: Arc<FakeCluster>) -> (QuarantineController, RecordStore) {
        let records = RecordStore::new(Arc::new(MemoryStore::new()));
        let metrics = QuarantineMetrics::new(&Registry::new()).unwrap();
        (
            QuarantineController::new(records.clone(), cluster, metrics),
            records,
        )
    }

    #[tokio::test]
    async fn test_fatal_event_cordons_and_advances() {
        let cluster = Arc::new(FakeCluster::new(&["n1"]));
        let (controller, records) = setup(cluster.clone());

        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let outcome = controller.reconcile("ev-1").await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        assert!(cluster.is_cordoned("n1"));
        assert!(cluster.is_owned("n1"));

        let event = records.get_event("ev-1").unwrap();
        assert_eq!(event.status.phase, EventPhase::Quarantined);
        let cond = event.status.condition(ConditionType::NodeQuarantined).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, reason::NODE_CORDONED);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new(&["n1"]));
        let (controller, records) = setup(cluster.clone());

        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        controller.reconcile("ev-1").await.unwrap();
        let rv = records.get_event("ev-1").unwrap().metadata.resource_version;

        // Second pass: precondition no longer holds, nothing changes
        controller.reconcile("ev-1").await.unwrap();
        assert_eq!(
            records.get_event("ev-1").unwrap().metadata.resource_version,
            rv
        );
        assert_eq!(cluster.cordon_calls(), 1);
    }

    #[tokio::test]
    async fn test_non_fatal_event_skips_cordon_but_advances() {
        let cluster = Arc::new(FakeCluster::new(&["n1"]));
        let (controller, records) = setup(cluster.clone());

        let mut event = fatal_event("ev-1", "n1");
        event.spec.is_fatal = false;
        records.create_event(&mut event).unwrap();

        controller.reconcile("ev-1").await.unwrap();

        assert!(!cluster.is_cordoned("n1"));
        let event = records.get_event("ev-1").unwrap();
        assert_eq!(event.status.phase, EventPhase::Quarantined);
        let cond = event.status.condition(ConditionType::NodeQuarantined).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, reason::SKIPPED);
    }

    #[tokio::test]
    async fn test_skip_override() {
        let cluster = Arc::new(FakeCluster::new(&["n1"]));
        let (controller, records) = setup(cluster.clone());

        let mut event = fatal_event("ev-1", "n1");
        event.spec.overrides.quarantine.skip = true;
        records.create_event(&mut event).unwrap();

        controller.reconcile("ev-1").await.unwrap();

        assert!(!cluster.is_cordoned("n1"));
        assert_eq!(
            records.get_event("ev-1").unwrap().status.phase,
            EventPhase::Quarantined
        );
    }

    #[tokio::test]
    async fn test_missing_node_requeues_without_advancing() {
        let cluster = Arc::new(FakeCluster::new(&[]));
        let (controller, records) = setup(cluster);

        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let outcome = controller.reconcile("ev-1").await.unwrap();
        assert_eq!(outcome, Outcome::Requeue);

        let event = records.get_event("ev-1").unwrap();
        assert_eq!(event.status.phase, EventPhase::New);
        let cond = event.status.condition(ConditionType::NodeQuarantined).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, reason::NODE_MISSING);
    }

    #[tokio::test]
    async fn test_deleted_event_is_done() {
        let cluster = Arc::new(FakeCluster::new(&["n1"]));
        let (controller, _records) = setup(cluster);
        assert_eq!(controller.reconcile("gone").await.unwrap(), Outcome::Done);
    }
}
