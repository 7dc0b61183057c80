//! Drain controller
//!
//! Second stage: once an event is `Quarantined`, user pods are evicted from
//! the node. Listing already excludes protected pods (system namespaces,
//! mirror pods, daemonset members), so "no evictable pods" and the drain
//! skip override both short-circuit straight to `Drained`. Evictions
//! rejected by a disruption budget are retried with backoff and surfaced on
//! the PodsDrained condition; no deadline is imposed at this layer.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::controllers::{record_err, EvictError, Outcome, PodEvictor, PodRef, Reconcile};
use crate::error::ControllerError;
use crate::event::{reason, ConditionStatus, ConditionType};
use crate::phase::EventPhase;
use crate::records::{RecordStore, StatusUpdate};

pub struct DrainController {
    records: RecordStore,
    pods: Arc<dyn PodEvictor>,
    metrics: crate::metrics::DrainMetrics,
}

impl DrainController {
    pub fn new(
        records: RecordStore,
        pods: Arc<dyn PodEvictor>,
        metrics: crate::metrics::DrainMetrics,
    ) -> Self {
        Self {
            records,
            pods,
            metrics,
        }
    }

    fn count(&self, node: &str, outcome: &str) {
        self.metrics.actions.with_label_values(&[node, outcome]).inc();
    }

    /// Mark the drain finished.
    fn complete(&self, event_name: &str, why: &str, message: &str) -> Result<(), ControllerError> {
        self.records
            .update_event_status(event_name, |e| {
                if !matches!(
                    e.status.phase,
                    EventPhase::Quarantined | EventPhase::Draining
                ) {
                    return StatusUpdate::Abort;
                }
                e.status.set_condition(
                    ConditionType::PodsDrained,
                    ConditionStatus::True,
                    why,
                    message,
                    Utc::now(),
                );
                e.status.phase = EventPhase::Drained;
                StatusUpdate::Apply
            })
            .map_err(record_err)?;
        Ok(())
    }

    /// Evict everything still on the node. Returns the number of pods still
    /// pending and whether any eviction was rejected by a disruption budget.
    async fn evict_all(&self, node: &str, pods: &[PodRef]) -> (usize, bool) {
        let gangs: BTreeSet<&str> = pods
            .iter()
            .filter_map(|p| p.gang_id.as_deref())
            .collect();
        if !gangs.is_empty() {
            info!(node = %node, gangs = ?gangs, "Draining pods from workload groups");
        }

        let mut pending = 0usize;
        let mut blocked = false;

        for pod in pods {
            match self.pods.evict(pod).await {
                Ok(()) => {
                    debug!(namespace = %pod.namespace, pod = %pod.name, "Pod evicted");
                    self.count(node, "evicted");
                }
                Err(EvictError::Gone(_)) => {}
                Err(EvictError::Blocked(msg)) => {
                    debug!(namespace = %pod.namespace, pod = %pod.name, detail = %msg, "Eviction blocked");
                    self.count(node, "failed");
                    pending += 1;
                    blocked = true;
                }
                Err(EvictError::Transient(msg)) => {
                    warn!(namespace = %pod.namespace, pod = %pod.name, error = %msg, "Eviction failed");
                    self.count(node, "failed");
                    pending += 1;
                }
            }
        }

        (pending, blocked)
    }
}

#[async_trait]
impl Reconcile for DrainController {
    fn name(&self) -> &'static str {
        "drain"
    }

    async fn reconcile(&self, event_name: &str) -> Result<Outcome, ControllerError> {
        let event = match self.records.get_event(event_name) {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => return Err(record_err(e)),
        };

        if !matches!(
            event.status.phase,
            EventPhase::Quarantined | EventPhase::Draining
        ) {
            return Ok(Outcome::Done);
        }

        let node = event.spec.node_name.clone();

        // Non-fatal events ride through the pipeline without touching pods
        if event.status.phase == EventPhase::Quarantined
            && (event.spec.overrides.drain.skip || !event.spec.is_fatal)
        {
            let message = if event.spec.is_fatal {
                "drain skipped by override"
            } else {
                "event is not fatal"
            };
            self.complete(event_name, reason::SKIPPED, message)?;
            self.count(&node, "skipped");
            return Ok(Outcome::Done);
        }

        let pods = match self.pods.evictable_pods(&node).await {
            Ok(pods) => pods,
            // Node deleted under us: nothing left to drain
            Err(crate::controllers::NodeOpError::NotFound(_)) => Vec::new(),
            Err(crate::controllers::NodeOpError::Transient(msg)) => {
                return Err(ControllerError::Transient(msg));
            }
        };

        if pods.is_empty() {
            let (why, message, outcome_label) = if event.status.phase == EventPhase::Quarantined {
                (reason::SKIPPED, "no evictable pods on node", "skipped")
            } else {
                (reason::COMPLETED, "all evictable pods evicted", "completed")
            };
            self.complete(event_name, why, message)?;
            info!(event = %event_name, node = %node, "Drain finished");
            self.count(&node, outcome_label);
            return Ok(Outcome::Done);
        }

        if event.status.phase == EventPhase::Quarantined {
            self.records
                .update_event_status(event_name, |e| {
                    if e.status.phase != EventPhase::Quarantined {
                        return StatusUpdate::Abort;
                    }
                    e.status.set_condition(
                        ConditionType::PodsDrained,
                        ConditionStatus::Unknown,
                        reason::IN_PROGRESS,
                        &format!("{} pods to evict", pods.len()),
                        Utc::now(),
                    );
                    e.status.phase = EventPhase::Draining;
                    StatusUpdate::Apply
                })
                .map_err(record_err)?;
            info!(event = %event_name, node = %node, pods = pods.len(), "Drain started");
        }

        let (pending, blocked) = self.evict_all(&node, &pods).await;

        if pending == 0 {
            // Evictions landed synchronously against the fake or the pods
            // were already terminating; verify on the next pass.
            return Ok(Outcome::Requeue);
        }

        if blocked {
            self.records
                .update_event_status(event_name, |e| {
                    if e.status.phase != EventPhase::Draining {
                        return StatusUpdate::Abort;
                    }
                    e.status.set_condition(
                        ConditionType::PodsDrained,
                        ConditionStatus::Unknown,
                        reason::BLOCKED,
                        &format!("{} pods held back by disruption budgets", pending),
                        Utc::now(),
                    );
                    StatusUpdate::Apply
                })
                .map_err(record_err)?;
        }

        Ok(Outcome::Requeue)
    }
}
