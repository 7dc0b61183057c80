//! TTL / resolution controller
//!
//! Garbage-collects resolved HealthEvents once their retention elapses and
//! gives the node back to the scheduler when the last active event on it is
//! resolved or deleted. Uncordoning only happens when the ownership
//! annotation shows the quarantine controller cordoned the node; nodes
//! cordoned by operators or other systems are left alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::controllers::{record_err, NodeAdmin, NodeOpError, Outcome, Reconcile};
use crate::error::ControllerError;
use crate::event::HealthEvent;
use crate::phase::EventPhase;
use crate::records::RecordStore;

/// Default retention for resolved events.
pub const DEFAULT_RESOLVED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

pub struct TtlController {
    records: RecordStore,
    nodes: Arc<dyn NodeAdmin>,
    retention: chrono::Duration,
    metrics: crate::metrics::TtlMetrics,
}

impl TtlController {
    pub fn new(
        records: RecordStore,
        nodes: Arc<dyn NodeAdmin>,
        retention: Duration,
        metrics: crate::metrics::TtlMetrics,
    ) -> Self {
        Self {
            records,
            nodes,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            metrics,
        }
    }

    fn has_active_events(&self, node: &str) -> Result<bool, ControllerError> {
        Ok(!self
            .records
            .open_events_for_node(node)
            .map_err(record_err)?
            .is_empty())
    }

    async fn release_node_if_idle(&self, node: &str) -> Result<(), ControllerError> {
        if self.has_active_events(node)? {
            return Ok(());
        }

        match self.nodes.uncordon_owned(node).await {
            Ok(true) => {
                info!(node = %node, "Node released back to the scheduler");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(NodeOpError::NotFound(_)) => Ok(()),
            Err(NodeOpError::Transient(msg)) => Err(ControllerError::Transient(msg)),
        }
    }
}

#[async_trait]
impl Reconcile for TtlController {
    fn name(&self) -> &'static str {
        "ttl"
    }

    async fn reconcile(&self, event_name: &str) -> Result<Outcome, ControllerError> {
        let event = match self.records.get_event(event_name) {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => return Err(record_err(e)),
        };

        if event.status.phase != EventPhase::Resolved {
            return Ok(Outcome::Done);
        }

        let node = event.spec.node_name.clone();
        self.release_node_if_idle(&node).await?;

        let Some(resolved_at) = event.status.resolved_at else {
            // update_event_status refuses to write this state; seeing it
            // means the record was produced outside the status path.
            return Err(ControllerError::InvariantViolation(format!(
                "resolved event {} has no resolvedAt",
                event_name
            )));
        };

        let deadline = resolved_at + self.retention;
        let now = Utc::now();

        if now < deadline {
            let wait = (deadline - now)
                .to_std()
                .unwrap_or_else(|_| Duration::from_secs(1));
            return Ok(Outcome::RequeueAfter(wait));
        }

        let phase = event.status.phase.to_string();
        match self.records.delete_event(event_name) {
            Ok(_) => {
                info!(event = %event_name, node = %node, "Resolved HealthEvent expired");
                self.metrics
                    .deletions
                    .with_label_values(&[node.as_str(), phase.as_str()])
                    .inc();
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(record_err(e)),
        }

        self.release_node_if_idle(&node).await?;
        Ok(Outcome::Done)
    }

    async fn observe_deleted(&self, event: &HealthEvent) {
        // Deletions by operators count too: if that was the last event for
        // the node, give it back.
        if let Err(e) = self.release_node_if_idle(&event.spec.node_name).await {
            warn!(
                node = %event.spec.node_name,
                error = %e,
                "Failed to release node after event deletion"
            );
        }
    }
}
