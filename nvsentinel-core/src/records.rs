//! Typed record access
//!
//! Wraps the raw object store with HealthEvent / RebootNode encoding and
//! centralizes the status-write rules every controller must obey: phase
//! transitions are validated against the pipeline graph, `resolvedAt` must
//! agree with the phase, spec is immutable on the status path, and
//! `lastUpdated` is bumped on every effective write.

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::event::{HealthEvent, RebootNode};
use crate::phase::{self, EventPhase};
use crate::store::{MemoryStore, RawObject, StoreError, UpdateError, WatchHandle};

use std::sync::Arc;

pub const HEALTH_EVENT_PREFIX: &str = "/healthevents/";
pub const REBOOT_NODE_PREFIX: &str = "/rebootnodes/";

fn event_key(name: &str) -> String {
    format!("{}{}", HEALTH_EVENT_PREFIX, name)
}

fn reboot_key(name: &str) -> String {
    format!("{}{}", REBOOT_NODE_PREFIX, name)
}

/// Failure of a typed record operation.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The status write tried to move the phase against the pipeline graph.
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: EventPhase, to: EventPhase },

    /// A record-level invariant check failed.
    #[error("invariant: {0}")]
    Invariant(String),

    #[error("decode {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
}

impl RecordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecordError::Store(e) if e.is_not_found())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, RecordError::Store(e) if e.is_already_exists())
    }
}

impl From<UpdateError<RecordError>> for RecordError {
    fn from(err: UpdateError<RecordError>) -> Self {
        match err {
            UpdateError::Store(e) => RecordError::Store(e),
            UpdateError::Mutator(e) => e,
        }
    }
}

/// Mutator verdict for a status update.
pub enum StatusUpdate {
    /// Persist the mutation (if it changed anything).
    Apply,
    /// Leave the record untouched; the precondition no longer holds.
    Abort,
}

/// Result of a status update.
#[derive(Debug)]
pub enum StatusOutcome {
    /// A new revision was written.
    Updated(HealthEvent),
    /// The mutation produced no effective change; nothing was written.
    Unchanged(HealthEvent),
    /// The mutator aborted; nothing was written.
    Aborted,
}

impl StatusOutcome {
    pub fn event(&self) -> Option<&HealthEvent> {
        match self {
            StatusOutcome::Updated(e) | StatusOutcome::Unchanged(e) => Some(e),
            StatusOutcome::Aborted => None,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &RawObject) -> Result<T, RecordError> {
    serde_json::from_value(raw.value.clone()).map_err(|source| RecordError::Decode {
        key: key.to_string(),
        source,
    })
}

fn encode<T: serde::Serialize>(record: &T) -> Value {
    // Record types serialize infallibly (string keys, finite numbers)
    serde_json::to_value(record).expect("record serialization")
}

/// Typed facade over the object store shared by the publisher and the
/// controllers.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<MemoryStore>,
}

impl RecordStore {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // HealthEvent
    // ------------------------------------------------------------------

    /// Persist a new HealthEvent; its resource version is filled in from the
    /// store revision.
    pub fn create_event(&self, event: &mut HealthEvent) -> Result<(), RecordError> {
        let mut clean = event.clone();
        clean.metadata.resource_version = 0;

        let raw = self.store.create(&event_key(&event.metadata.name), encode(&clean))?;
        event.metadata.resource_version = raw.revision;
        Ok(())
    }

    pub fn get_event(&self, name: &str) -> Result<HealthEvent, RecordError> {
        let key = event_key(name);
        let raw = self.store.get(&key)?;
        let mut event: HealthEvent = decode(&key, &raw)?;
        event.metadata.resource_version = raw.revision;
        Ok(event)
    }

    pub fn list_events(&self) -> Result<Vec<HealthEvent>, RecordError> {
        let list = self.store.get_list(HEALTH_EVENT_PREFIX);
        let mut events = Vec::with_capacity(list.items.len());
        for (key, raw) in &list.items {
            let mut event: HealthEvent = decode(key, raw)?;
            event.metadata.resource_version = raw.revision;
            events.push(event);
        }
        Ok(events)
    }

    /// Open (non-resolved) events targeting a node.
    pub fn open_events_for_node(&self, node: &str) -> Result<Vec<HealthEvent>, RecordError> {
        Ok(self
            .list_events()?
            .into_iter()
            .filter(|e| e.spec.node_name == node && e.is_open())
            .collect())
    }

    pub fn delete_event(&self, name: &str) -> Result<HealthEvent, RecordError> {
        let key = event_key(name);
        let raw = self.store.delete(&key)?;
        decode(&key, &raw)
    }

    pub fn watch_events(&self) -> WatchHandle {
        self.store.watch(HEALTH_EVENT_PREFIX)
    }

    /// Decode the HealthEvent carried by a watch notification.
    pub fn decode_event(&self, key: &str, raw: &RawObject) -> Result<HealthEvent, RecordError> {
        let mut event: HealthEvent = decode(key, raw)?;
        event.metadata.resource_version = raw.revision;
        Ok(event)
    }

    /// Read-modify-write of a HealthEvent status under optimistic
    /// concurrency.
    ///
    /// The mutator sees the freshest record on every attempt and returns
    /// `Apply` or `Abort`. Before a write lands, the facade rejects phase
    /// regressions (`InvalidTransition`), spec mutations, and a `resolvedAt`
    /// that disagrees with the phase; it stamps `lastUpdated` on every
    /// effective write.
    pub fn update_event_status<F>(&self, name: &str, apply: F) -> Result<StatusOutcome, RecordError>
    where
        F: FnMut(&mut HealthEvent) -> StatusUpdate,
    {
        self.update_event_inner(name, false, apply)
    }

    /// Update path for the producing component: like
    /// [`update_event_status`](Self::update_event_status) but may also
    /// mutate the producer-owned spec fields (e.g. appending error codes).
    /// Identity and the lifecycle invariants still hold.
    pub fn update_event<F>(&self, name: &str, apply: F) -> Result<StatusOutcome, RecordError>
    where
        F: FnMut(&mut HealthEvent) -> StatusUpdate,
    {
        self.update_event_inner(name, true, apply)
    }

    fn update_event_inner<F>(
        &self,
        name: &str,
        allow_spec_change: bool,
        mut apply: F,
    ) -> Result<StatusOutcome, RecordError>
    where
        F: FnMut(&mut HealthEvent) -> StatusUpdate,
    {
        let key = event_key(name);
        let mut aborted = false;
        let mut result_event: Option<HealthEvent> = None;
        let mut wrote = false;

        let outcome = self.store.guaranteed_update(&key, false, |raw| {
            aborted = false;
            wrote = false;

            let mut event: HealthEvent = decode(&key, raw)?;
            event.metadata.resource_version = raw.revision;
            let before = event.clone();

            match apply(&mut event) {
                StatusUpdate::Abort => {
                    aborted = true;
                    return Ok(raw.value.clone());
                }
                StatusUpdate::Apply => {}
            }

            if event.metadata.name != before.metadata.name || event.metadata.uid != before.metadata.uid {
                return Err(RecordError::Invariant(
                    "update must not modify record identity".to_string(),
                ));
            }

            if !allow_spec_change && event.spec != before.spec {
                return Err(RecordError::Invariant(
                    "status update must not modify spec".to_string(),
                ));
            }

            if !phase::is_valid_transition(before.status.phase, event.status.phase) {
                return Err(RecordError::InvalidTransition {
                    from: before.status.phase,
                    to: event.status.phase,
                });
            }

            let resolved = event.status.phase == EventPhase::Resolved;
            if resolved != event.status.resolved_at.is_some() {
                return Err(RecordError::Invariant(format!(
                    "resolvedAt must be set exactly when phase is Resolved (phase={})",
                    event.status.phase
                )));
            }

            if event == before {
                debug!(event = %name, "status update is a no-op");
                result_event = Some(event);
                return Ok(raw.value.clone());
            }

            event.status.last_updated = Some(Utc::now());
            wrote = true;

            let mut clean = event.clone();
            clean.metadata.resource_version = 0;
            result_event = Some(event);
            Ok(encode(&clean))
        });

        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => return Err(RecordError::from(err)),
        };

        if aborted {
            return Ok(StatusOutcome::Aborted);
        }

        let mut event = result_event.expect("mutator ran");
        if let Some(raw) = raw {
            event.metadata.resource_version = raw.revision;
        }

        if wrote {
            Ok(StatusOutcome::Updated(event))
        } else {
            Ok(StatusOutcome::Unchanged(event))
        }
    }

    // ------------------------------------------------------------------
    // RebootNode
    // ------------------------------------------------------------------

    pub fn create_reboot(&self, reboot: &mut RebootNode) -> Result<(), RecordError> {
        let mut clean = reboot.clone();
        clean.metadata.resource_version = 0;

        let raw = self
            .store
            .create(&reboot_key(&reboot.metadata.name), encode(&clean))?;
        reboot.metadata.resource_version = raw.revision;
        Ok(())
    }

    pub fn get_reboot(&self, name: &str) -> Result<RebootNode, RecordError> {
        let key = reboot_key(name);
        let raw = self.store.get(&key)?;
        let mut reboot: RebootNode = decode(&key, &raw)?;
        reboot.metadata.resource_version = raw.revision;
        Ok(reboot)
    }

    pub fn list_reboots(&self) -> Result<Vec<RebootNode>, RecordError> {
        let list = self.store.get_list(REBOOT_NODE_PREFIX);
        let mut reboots = Vec::with_capacity(list.items.len());
        for (key, raw) in &list.items {
            let mut reboot: RebootNode = decode(key, raw)?;
            reboot.metadata.resource_version = raw.revision;
            reboots.push(reboot);
        }
        Ok(reboots)
    }

    /// Status update for a RebootNode; used by the external executor (and
    /// fakes in tests). No pipeline validation applies here.
    pub fn update_reboot_status<F>(&self, name: &str, mut apply: F) -> Result<RebootNode, RecordError>
    where
        F: FnMut(&mut RebootNode),
    {
        let key = reboot_key(name);
        let mut result: Option<RebootNode> = None;

        let raw = self
            .store
            .guaranteed_update(&key, false, |raw| {
                let mut reboot: RebootNode = decode(&key, raw)?;
                reboot.metadata.resource_version = raw.revision;
                apply(&mut reboot);

                let mut clean = reboot.clone();
                clean.metadata.resource_version = 0;
                result = Some(reboot);
                Ok::<_, RecordError>(encode(&clean))
            })
            .map_err(RecordError::from)?;

        let mut reboot = result.expect("mutator ran");
        if let Some(raw) = raw {
            reboot.metadata.resource_version = raw.revision;
        }
        Ok(reboot)
    }

    pub fn watch_reboots(&self) -> WatchHandle {
        self.store.watch(REBOOT_NODE_PREFIX)
    }

    pub fn decode_reboot(&self, key: &str, raw: &RawObject) -> Result<RebootNode, RecordError> {
        let mut reboot: RebootNode = decode(key, raw)?;
        reboot.metadata.resource_version = raw.revision;
        Ok(reboot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{reason, ConditionStatus, ConditionType};

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryStore::new()))
    }

    fn fatal_event(name: &str, node: &str) -> HealthEvent {
        let mut event = HealthEvent::default();
        event.metadata.name = name.to_string();
        event.metadata.uid = format!("uid-{}", name);
        event.spec.source = "test".to_string();
        event.spec.node_name = node.to_string();
        event.spec.check_name = "GpuXidError".to_string();
        event.spec.is_fatal = true;
        event.spec.error_codes = vec![79];
        event
    }

    #[test]
    fn test_create_get_round_trip() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");

        records.create_event(&mut event).unwrap();
        assert_eq!(event.metadata.resource_version, 1);

        let got = records.get_event("ev-1").unwrap();
        assert_eq!(got, event);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let err = records.create_event(&mut event.clone()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_status_update_advances_phase() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let outcome = records
            .update_event_status("ev-1", |e| {
                e.status.phase = EventPhase::Quarantined;
                e.status.set_condition(
                    ConditionType::NodeQuarantined,
                    ConditionStatus::True,
                    reason::NODE_CORDONED,
                    "",
                    Utc::now(),
                );
                StatusUpdate::Apply
            })
            .unwrap();

        let updated = match outcome {
            StatusOutcome::Updated(e) => e,
            other => panic!("expected Updated, got {:?}", other),
        };
        assert_eq!(updated.status.phase, EventPhase::Quarantined);
        assert!(updated.status.last_updated.is_some());
        assert!(updated.metadata.resource_version > event.metadata.resource_version);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let err = records
            .update_event_status("ev-1", |e| {
                e.status.phase = EventPhase::Remediated;
                StatusUpdate::Apply
            })
            .unwrap_err();

        assert!(matches!(
            err,
            RecordError::InvalidTransition {
                from: EventPhase::New,
                to: EventPhase::Remediated,
            }
        ));

        // Record is untouched
        let got = records.get_event("ev-1").unwrap();
        assert_eq!(got.status.phase, EventPhase::New);
    }

    #[test]
    fn test_resolved_at_must_agree_with_phase() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let err = records
            .update_event_status("ev-1", |e| {
                e.status.phase = EventPhase::Resolved;
                StatusUpdate::Apply
            })
            .unwrap_err();
        assert!(matches!(err, RecordError::Invariant(_)));

        let err = records
            .update_event_status("ev-1", |e| {
                e.status.resolved_at = Some(Utc::now());
                StatusUpdate::Apply
            })
            .unwrap_err();
        assert!(matches!(err, RecordError::Invariant(_)));
    }

    #[test]
    fn test_spec_is_immutable_on_status_path() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let err = records
            .update_event_status("ev-1", |e| {
                e.spec.node_name = "n2".to_string();
                StatusUpdate::Apply
            })
            .unwrap_err();
        assert!(matches!(err, RecordError::Invariant(_)));
    }

    #[test]
    fn test_publisher_path_may_extend_error_codes() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let outcome = records
            .update_event("ev-1", |e| {
                e.spec.error_codes.push(48);
                StatusUpdate::Apply
            })
            .unwrap();
        assert!(matches!(outcome, StatusOutcome::Updated(_)));
        assert_eq!(records.get_event("ev-1").unwrap().spec.error_codes, vec![79, 48]);

        // Identity stays frozen even on the publisher path
        let err = records
            .update_event("ev-1", |e| {
                e.metadata.uid = "other".to_string();
                StatusUpdate::Apply
            })
            .unwrap_err();
        assert!(matches!(err, RecordError::Invariant(_)));
    }

    #[test]
    fn test_abort_leaves_record_untouched() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();
        let rv = records.get_event("ev-1").unwrap().metadata.resource_version;

        let outcome = records
            .update_event_status("ev-1", |_| StatusUpdate::Abort)
            .unwrap();
        assert!(matches!(outcome, StatusOutcome::Aborted));

        assert_eq!(
            records.get_event("ev-1").unwrap().metadata.resource_version,
            rv
        );
    }

    #[test]
    fn test_noop_apply_skips_write() {
        let records = store();
        let mut event = fatal_event("ev-1", "n1");
        records.create_event(&mut event).unwrap();

        let outcome = records
            .update_event_status("ev-1", |_| StatusUpdate::Apply)
            .unwrap();
        assert!(matches!(outcome, StatusOutcome::Unchanged(_)));
        assert_eq!(records.store().current_revision(), 1);
    }

    #[test]
    fn test_reboot_record_lifecycle() {
        let records = store();
        let mut reboot = RebootNode::default();
        reboot.metadata.name = "reboot-uid-1".to_string();
        reboot.spec.node_name = "n1".to_string();
        reboot.spec.owning_health_event_uid = "uid-1".to_string();

        records.create_reboot(&mut reboot).unwrap();
        assert!(records.create_reboot(&mut reboot.clone()).unwrap_err().is_already_exists());

        let updated = records
            .update_reboot_status("reboot-uid-1", |r| {
                r.status.phase = crate::event::RebootPhase::Completed;
            })
            .unwrap();
        assert_eq!(updated.status.phase, crate::event::RebootPhase::Completed);

        let got = records.get_reboot("reboot-uid-1").unwrap();
        assert_eq!(got.status.phase, crate::event::RebootPhase::Completed);
    }
}
