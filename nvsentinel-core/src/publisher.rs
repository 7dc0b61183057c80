//! HealthEvent publisher
//!
//! Consumes raw producer signals and folds them into cluster-scoped
//! HealthEvents: one record per distinct fault per node, resolved when the
//! producer reports recovery. De-duplication is unbounded in time; once a
//! record resolves, a recurrence of the same fault produces a new record so
//! the history stays auditable.

use std::time::Duration;

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::event::HealthEvent;
use crate::metrics::PublisherMetrics;
use crate::records::{RecordError, RecordStore, StatusOutcome, StatusUpdate};
use crate::signal::{dedup_preserving_order, HealthSignal, SIGNAL_SCHEMA_VERSION};
use crate::xid::{self, XidSeverity};

/// Retry policy and classification overrides for publishing signals.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Operator-supplied XID codes to ignore in addition to the built-in
    /// table; a fatal signal whose codes are all ignored is demoted.
    pub additional_ignored_codes: Vec<u64>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            additional_ignored_codes: Vec::new(),
        }
    }
}

impl PublisherConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.initial_backoff.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_backoff)
    }
}

/// What a published signal did to the record set.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new HealthEvent was created under this name.
    Created(String),
    /// An existing open HealthEvent absorbed the signal.
    Updated(String),
    /// A healthy signal resolved this many open events.
    Resolved(usize),
    /// Nothing matched (healthy signal with no open events).
    NoMatch,
}

/// Failure to publish one signal.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("unsupported signal version {0:?}")]
    UnsupportedVersion(String),

    #[error("signal missing nodeName")]
    MissingNode,

    #[error("retries exhausted: {0}")]
    RetriesExhausted(#[source] RecordError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

pub struct Publisher {
    records: RecordStore,
    metrics: PublisherMetrics,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(records: RecordStore, metrics: PublisherMetrics, config: PublisherConfig) -> Self {
        Self {
            records,
            metrics,
            config,
        }
    }

    /// Drain the signal channel until it closes or shutdown is signalled.
    pub async fn run(
        &self,
        mut signals: mpsc::Receiver<HealthSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting health event publisher");

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        debug!("Signal channel closed, publisher exiting");
                        break;
                    };

                    let node = signal.node_name.clone();
                    match self.publish(&signal).await {
                        Ok(outcome) => debug!(node = %node, ?outcome, "Signal published"),
                        Err(e) => {
                            error!(node = %node, error = %e, "Failed to publish signal");
                            self.metrics.errors.with_label_values(&[node.as_str()]).inc();
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, publisher exiting");
                        break;
                    }
                }
            }
        }
    }

    /// Publish one signal, retrying transient store races with bounded
    /// exponential backoff.
    pub async fn publish(&self, signal: &HealthSignal) -> Result<PublishOutcome, PublishError> {
        if signal.version != SIGNAL_SCHEMA_VERSION {
            return Err(PublishError::UnsupportedVersion(signal.version.clone()));
        }
        if signal.node_name.is_empty() {
            return Err(PublishError::MissingNode);
        }

        let mut last_err: Option<RecordError> = None;

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }

            let result = if signal.is_healthy {
                self.resolve_matching(signal)
            } else {
                self.record_fault(signal)
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                // Create lost a race with a concurrent publish of the same
                // fault; the update path will find the record next attempt.
                Err(e) if e.is_already_exists() => {
                    debug!(node = %signal.node_name, "Create collided, retrying as update");
                    last_err = Some(e);
                }
                Err(e @ RecordError::Store(_)) => {
                    warn!(node = %signal.node_name, error = %e, attempt, "Publish attempt failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PublishError::RetriesExhausted(
            last_err.unwrap_or_else(|| RecordError::Invariant("no attempt ran".to_string())),
        ))
    }

    /// Healthy signal: resolve every open event on the node that matches
    /// (source, checkName); all of the source's checks when checkName is
    /// empty. Idempotent for already-resolved events.
    fn resolve_matching(&self, signal: &HealthSignal) -> Result<PublishOutcome, RecordError> {
        let open = self.records.open_events_for_node(&signal.node_name)?;
        let mut resolved = 0usize;

        for event in open {
            if event.spec.source != signal.source {
                continue;
            }
            if !signal.check_name.is_empty() && event.spec.check_name != signal.check_name {
                continue;
            }

            let message = if signal.message.is_empty() {
                format!("healthy signal from {}", signal.source)
            } else {
                signal.message.clone()
            };

            let outcome = self
                .records
                .update_event_status(&event.metadata.name, |e| {
                    if !e.is_open() {
                        return StatusUpdate::Abort;
                    }
                    e.mark_resolved(&message, Utc::now());
                    StatusUpdate::Apply
                });

            match outcome {
                Ok(StatusOutcome::Updated(e)) => {
                    info!(
                        event = %e.metadata.name,
                        node = %signal.node_name,
                        "HealthEvent resolved"
                    );
                    resolved += 1;
                }
                Ok(_) => {}
                // Deleted between list and update; nothing left to resolve.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if resolved == 0 {
            Ok(PublishOutcome::NoMatch)
        } else {
            Ok(PublishOutcome::Resolved(resolved))
        }
    }

    /// Unhealthy signal: fold into the matching open event or create a new
    /// record.
    fn record_fault(&self, signal: &HealthSignal) -> Result<PublishOutcome, RecordError> {
        let prefix = self.name_prefix(signal);

        let existing = self
            .records
            .open_events_for_node(&signal.node_name)?
            .into_iter()
            .find(|e| {
                e.spec.check_name == signal.check_name && e.metadata.name.starts_with(&prefix)
            });

        if let Some(event) = existing {
            let codes = signal.error_codes.clone();
            let outcome = self
                .records
                .update_event(&event.metadata.name, |e| {
                    if !e.is_open() {
                        return StatusUpdate::Abort;
                    }
                    e.spec.error_codes.extend(codes.iter().copied());
                    dedup_preserving_order(&mut e.spec.error_codes);
                    // Phase is untouched; only the freshness marker moves.
                    e.status.last_updated = Some(Utc::now());
                    StatusUpdate::Apply
                });

            match outcome {
                Ok(StatusOutcome::Aborted) => {
                    // Resolved concurrently; a recurrence gets a new record.
                    debug!(event = %event.metadata.name, "Matched event resolved mid-update");
                }
                Ok(_) => return Ok(PublishOutcome::Updated(event.metadata.name)),
                Err(e) if e.is_not_found() => {
                    debug!(event = %event.metadata.name, "Matched event deleted mid-update");
                }
                Err(e) => return Err(e),
            }
        }

        let mut event = HealthEvent::default();
        event.metadata.name = format!("{}{}", prefix, name_suffix());
        event.metadata.uid = Uuid::new_v4().to_string();
        event.spec = signal.to_event_spec(Utc::now());

        // Operator override: a "fatal" signal whose codes are all ignored
        // does not get to drive the pipeline.
        if event.spec.is_fatal
            && !event.spec.error_codes.is_empty()
            && event.spec.error_codes.iter().all(|&code| {
                xid::classify(code, &self.config.additional_ignored_codes) == XidSeverity::Ignored
            })
        {
            info!(
                node = %signal.node_name,
                codes = ?event.spec.error_codes,
                "All error codes ignored, demoting fatal signal"
            );
            event.spec.is_fatal = false;
        }

        self.records.create_event(&mut event)?;
        info!(
            event = %event.metadata.name,
            node = %signal.node_name,
            check = %signal.check_name,
            codes = ?event.spec.error_codes,
            "HealthEvent created"
        );

        Ok(PublishOutcome::Created(event.metadata.name))
    }

    /// Deterministic name prefix for a fault: node, check and signature.
    /// The random suffix added at creation avoids collisions with resolved
    /// records of the same fault.
    fn name_prefix(&self, signal: &HealthSignal) -> String {
        format!(
            "{}-{}-{}-",
            sanitize(&signal.node_name),
            sanitize(&signal.check_name),
            &signal.signature()[..8]
        )
    }
}

/// Lowercase alphanumeric-and-dash form usable as an object name segment.
fn sanitize(s: &str) -> String {
    let out: String = s
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.trim_matches('-').to_string()
}

fn name_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric())
        .take(5)
        .collect()
}
