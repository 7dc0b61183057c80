//! Controller framework
//!
//! Each controller is a reconciliation loop driven by change notifications
//! on HealthEvent records. The runner owns a worker pool sharded by event
//! name, so one event is never reconciled concurrently by the same
//! controller while different events proceed in parallel. Controllers
//! coordinate exclusively through HealthEvent phase and conditions; they
//! never hold references to each other.

pub mod drain;
pub mod fake;
pub mod quarantine;
pub mod remediation;
pub mod ttl;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::event::HealthEvent;
use crate::metrics::RunnerMetrics;
use crate::records::{RecordError, RecordStore};
use crate::store::WatchEvent;

pub use drain::DrainController;
pub use quarantine::QuarantineController;
pub use remediation::RemediationController;
pub use ttl::TtlController;

/// Failure of a node-level operation behind the NodeAdmin seam.
#[derive(Debug, Error)]
pub enum NodeOpError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Transient(String),
}

/// Failure of a pod eviction behind the PodEvictor seam.
#[derive(Debug, Error)]
pub enum EvictError {
    /// Rejected by a PodDisruptionBudget; retried with backoff.
    #[error("eviction blocked: {0}")]
    Blocked(String),

    /// The pod disappeared before the eviction landed.
    #[error("pod gone: {0}")]
    Gone(String),

    #[error("{0}")]
    Transient(String),
}

/// A pod targeted for eviction, with its workload group when one is
/// discoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub gang_id: Option<String>,
}

/// Node administration capability consumed by the quarantine and TTL
/// controllers. Implementations must be idempotent.
#[async_trait]
pub trait NodeAdmin: Send + Sync {
    /// Mark the node unschedulable and record ownership via the controller
    /// annotation. Cordoning an already-cordoned node is a no-op; a node
    /// cordoned by someone else is left unowned so it is never uncordoned
    /// by us.
    async fn cordon(&self, node: &str) -> Result<(), NodeOpError>;

    /// Make the node schedulable again, but only if the ownership
    /// annotation shows we cordoned it. Returns whether an uncordon
    /// happened.
    async fn uncordon_owned(&self, node: &str) -> Result<bool, NodeOpError>;
}

/// Pod eviction capability consumed by the drain controller. Listing already
/// excludes protected pods (system namespaces, mirror pods, daemonset
/// members).
#[async_trait]
pub trait PodEvictor: Send + Sync {
    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>, NodeOpError>;

    async fn evict(&self, pod: &PodRef) -> Result<(), EvictError>;
}

/// What a reconcile pass wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing more to do until the record changes again.
    Done,
    /// Try again with backoff.
    Requeue,
    /// Try again after a fixed delay (timers, completion polls).
    RequeueAfter(Duration),
}

/// One control loop over HealthEvent records.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Reconcile the named event: re-read, check the precondition, perform
    /// at most one side effect, update status. Must tolerate repeat
    /// invocations for the same (event, phase).
    async fn reconcile(&self, event_name: &str) -> Result<Outcome, ControllerError>;

    /// Called with the last seen object when a record is deleted. Most
    /// controllers do not care.
    async fn observe_deleted(&self, _event: &HealthEvent) {}
}

/// Map record-layer failures onto the controller error taxonomy.
pub fn record_err(err: RecordError) -> ControllerError {
    match err {
        RecordError::Store(e) if e.is_not_found() => {
            ControllerError::ResourceMissing(e.to_string())
        }
        RecordError::Store(e) => ControllerError::Transient(e.to_string()),
        RecordError::InvalidTransition { from, to } => ControllerError::InvariantViolation(
            format!("invalid phase transition from {} to {}", from, to),
        ),
        RecordError::Invariant(msg) => ControllerError::InvariantViolation(msg),
        RecordError::Decode { .. } => ControllerError::InvariantViolation(err.to_string()),
    }
}

/// Exponential backoff for re-queued events.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max)
    }
}

/// Runner configuration shared by all controllers.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker pool size; events shard across workers by name.
    pub workers: usize,
    /// Per-reconcile deadline.
    pub timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Drives one reconciler from the HealthEvent watch stream.
pub struct ControllerRunner {
    records: RecordStore,
    config: RunnerConfig,
    metrics: Arc<RunnerMetrics>,
}

impl ControllerRunner {
    pub fn new(records: RecordStore, config: RunnerConfig, metrics: Arc<RunnerMetrics>) -> Self {
        Self {
            records,
            config,
            metrics,
        }
    }

    /// Run until shutdown. Seeds every existing event, then follows the
    /// watch; a watcher that falls behind is re-established with a full
    /// resync.
    pub async fn run<R: Reconcile>(&self, reconciler: Arc<R>, shutdown: watch::Receiver<bool>) {
        let name = reconciler.name();
        let workers = self.config.workers.max(1);
        info!(controller = name, workers, "Starting controller");

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            senders.push(tx.clone());
            handles.push(tokio::spawn(run_worker(
                worker_id,
                reconciler.clone(),
                rx,
                tx,
                self.config.clone(),
                self.metrics.clone(),
                shutdown.clone(),
            )));
        }

        self.dispatch_loop(reconciler, &senders, shutdown).await;

        drop(senders);
        for handle in handles {
            let _ = handle.await;
        }
        info!(controller = name, "Controller stopped");
    }

    async fn dispatch_loop<R: Reconcile>(
        &self,
        reconciler: Arc<R>,
        senders: &[mpsc::UnboundedSender<String>],
        mut shutdown: watch::Receiver<bool>,
    ) {
        let name = reconciler.name();

        'resync: loop {
            let mut stream = self.records.watch_events();

            // Resync: every existing event gets a pass. The watch is opened
            // first so writes landing during the listing are not lost.
            match self.records.list_events() {
                Ok(events) => {
                    for event in events {
                        dispatch(senders, &event.metadata.name);
                    }
                }
                Err(e) => warn!(controller = name, error = %e, "Initial listing failed"),
            }

            loop {
                tokio::select! {
                    event = stream.recv() => match event {
                        Some(WatchEvent::Added { ref object, .. })
                        | Some(WatchEvent::Modified { ref object, .. }) => {
                            match self.records.decode_event("", object) {
                                Ok(event) => dispatch(senders, &event.metadata.name),
                                Err(e) => warn!(controller = name, error = %e, "Undecodable watch object"),
                            }
                        }
                        Some(WatchEvent::Deleted { ref object, .. }) => {
                            match self.records.decode_event("", object) {
                                Ok(event) => reconciler.observe_deleted(&event).await,
                                Err(e) => warn!(controller = name, error = %e, "Undecodable deleted object"),
                            }
                        }
                        Some(WatchEvent::Overflowed) => {
                            warn!(controller = name, "Watch fell behind, resyncing");
                            continue 'resync;
                        }
                        None => {
                            debug!(controller = name, "Watch closed");
                            return;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(controller = name, "Shutdown signal received");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Stable shard assignment: one event always lands on the same worker.
fn dispatch(senders: &[mpsc::UnboundedSender<String>], event_name: &str) {
    let mut hasher = DefaultHasher::new();
    event_name.hash(&mut hasher);
    let index = (hasher.finish() % senders.len() as u64) as usize;
    let _ = senders[index].send(event_name.to_string());
}

async fn run_worker<R: Reconcile>(
    worker_id: usize,
    reconciler: Arc<R>,
    mut rx: mpsc::UnboundedReceiver<String>,
    requeue_tx: mpsc::UnboundedSender<String>,
    config: RunnerConfig,
    metrics: Arc<RunnerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let controller = reconciler.name();
    let mut attempts: HashMap<String, u32> = HashMap::new();

    loop {
        let event_name = tokio::select! {
            item = rx.recv() => match item {
                Some(name) => name,
                None => return,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        let result = timeout(config.timeout, reconciler.reconcile(&event_name)).await;

        let requeue_in = match result {
            Err(_) => {
                warn!(controller, event = %event_name, "Reconcile timed out");
                Some(backoff_delay(&config, &mut attempts, &event_name))
            }
            Ok(Ok(Outcome::Done)) => {
                attempts.remove(&event_name);
                None
            }
            Ok(Ok(Outcome::Requeue)) => Some(backoff_delay(&config, &mut attempts, &event_name)),
            Ok(Ok(Outcome::RequeueAfter(delay))) => {
                attempts.remove(&event_name);
                Some(delay)
            }
            Ok(Err(ControllerError::Transient(msg))) => {
                warn!(controller, event = %event_name, error = %msg, "Transient failure");
                Some(backoff_delay(&config, &mut attempts, &event_name))
            }
            Ok(Err(ControllerError::PreconditionMissed(msg))) => {
                // Expected under concurrent updates; quiet retry.
                debug!(controller, event = %event_name, detail = %msg, "Precondition missed");
                Some(backoff_delay(&config, &mut attempts, &event_name))
            }
            Ok(Err(ControllerError::InvariantViolation(msg))) => {
                error!(controller, event = %event_name, error = %msg, "Invariant violation");
                metrics
                    .invariant_violations
                    .with_label_values(&[controller])
                    .inc();
                attempts.remove(&event_name);
                None
            }
            Ok(Err(ControllerError::ResourceMissing(msg))) => {
                debug!(controller, event = %event_name, detail = %msg, "Resource missing");
                attempts.remove(&event_name);
                None
            }
            Ok(Err(ControllerError::Fatal(msg))) => {
                error!(controller, worker = worker_id, error = %msg, "Fatal controller error");
                return;
            }
        };

        if let Some(delay) = requeue_in {
            let tx = requeue_tx.clone();
            let name = event_name.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => { let _ = tx.send(name); }
                    _ = shutdown.changed() => {}
                }
            });
        }
    }
}

fn backoff_delay(
    config: &RunnerConfig,
    attempts: &mut HashMap<String, u32>,
    event_name: &str,
) -> Duration {
    let attempt = attempts.entry(event_name.to_string()).or_insert(0);
    let delay = config.backoff.delay(*attempt);
    *attempt = attempt.saturating_add(1);
    delay
}
