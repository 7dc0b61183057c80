//! End-to-end lifecycle tests
//!
//! Drives producer signals through the publisher and all four controllers
//! over the in-memory store, with fake node/pod seams and a fake reboot
//! executor standing in for the external pieces.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::Registry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use nvsentinel_core::controllers::fake::FakeCluster;
use nvsentinel_core::controllers::{
    BackoffConfig, ControllerRunner, DrainController, QuarantineController,
    RemediationController, RunnerConfig, TtlController,
};
use nvsentinel_core::event::{ConditionStatus, ConditionType, RecommendedAction, reason};
use nvsentinel_core::metrics::{
    DrainMetrics, PublisherMetrics, QuarantineMetrics, RemediationMetrics, RunnerMetrics,
    TtlMetrics,
};
use nvsentinel_core::phase::{self, EventPhase};
use nvsentinel_core::publisher::{Publisher, PublisherConfig};
use nvsentinel_core::records::RecordStore;
use nvsentinel_core::signal::{HealthSignal, SIGNAL_SCHEMA_VERSION};
use nvsentinel_core::store::{MemoryStore, WatchEvent};
use nvsentinel_core::{HealthEvent, RebootPhase};

struct Harness {
    records: RecordStore,
    cluster: Arc<FakeCluster>,
    signals: mpsc::Sender<HealthSignal>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Every phase observed per event, in write order.
    phase_history: Arc<Mutex<Vec<(String, EventPhase)>>>,
}

impl Harness {
    fn start(nodes: &[&str], reboot_outcome: RebootPhase, retention: Duration) -> Self {
        let records = RecordStore::new(Arc::new(MemoryStore::new()));
        let cluster = Arc::new(FakeCluster::new(nodes));
        let registry = Registry::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::channel(64);
        let mut tasks = Vec::new();

        let runner_config = RunnerConfig {
            workers: 2,
            timeout: Duration::from_secs(5),
            backoff: BackoffConfig {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(40),
            },
        };
        let runner_metrics = Arc::new(RunnerMetrics::new(&registry).unwrap());

        // Publisher
        let publisher = Publisher::new(
            records.clone(),
            PublisherMetrics::new(&registry).unwrap(),
            PublisherConfig {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(2),
                max_backoff: Duration::from_millis(20),
                additional_ignored_codes: Vec::new(),
            },
        );
        {
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                publisher.run(signal_rx, shutdown).await;
            }));
        }

        // Controllers
        let quarantine = Arc::new(QuarantineController::new(
            records.clone(),
            cluster.clone(),
            QuarantineMetrics::new(&registry).unwrap(),
        ));
        let drain = Arc::new(DrainController::new(
            records.clone(),
            cluster.clone(),
            DrainMetrics::new(&registry).unwrap(),
        ));
        let remediation = Arc::new(
            RemediationController::new(records.clone(), RemediationMetrics::new(&registry).unwrap())
                .with_poll_interval(Duration::from_millis(5)),
        );
        let ttl = Arc::new(TtlController::new(
            records.clone(),
            cluster.clone(),
            retention,
            TtlMetrics::new(&registry).unwrap(),
        ));

        macro_rules! spawn_runner {
            ($reconciler:expr) => {{
                let runner = ControllerRunner::new(
                    records.clone(),
                    runner_config.clone(),
                    runner_metrics.clone(),
                );
                let shutdown = shutdown_rx.clone();
                let reconciler = $reconciler;
                tasks.push(tokio::spawn(async move {
                    runner.run(reconciler, shutdown).await;
                }));
            }};
        }
        spawn_runner!(quarantine);
        spawn_runner!(drain);
        spawn_runner!(remediation);
        spawn_runner!(ttl);

        // Fake reboot executor: completes (or fails) every RebootNode
        {
            let records = records.clone();
            let mut shutdown = shutdown_rx.clone();
            let mut reboots = records.watch_reboots();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = reboots.recv() => match event {
                            Some(WatchEvent::Added { key, object }) => {
                                let reboot = records.decode_reboot(&key, &object).unwrap();
                                let _ = records.update_reboot_status(&reboot.metadata.name, |r| {
                                    r.status.phase = reboot_outcome;
                                });
                            }
                            Some(_) => {}
                            None => break,
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Phase history recorder, for ordering assertions
        let phase_history = Arc::new(Mutex::new(Vec::new()));
        {
            let history = phase_history.clone();
            let records = records.clone();
            let mut events = records.watch_events();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(WatchEvent::Added { key, object })
                            | Some(WatchEvent::Modified { key, object }) => {
                                let event = records.decode_event(&key, &object).unwrap();
                                history
                                    .lock()
                                    .unwrap()
                                    .push((event.metadata.name.clone(), event.status.phase));
                            }
                            Some(_) => {}
                            None => break,
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        Self {
            records,
            cluster,
            signals: signal_tx,
            shutdown: shutdown_tx,
            tasks,
            phase_history,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }

    async fn send(&self, signal: HealthSignal) {
        self.signals.send(signal).await.expect("publisher alive");
    }

    /// Name of the single event for (node, check), once it exists.
    async fn event_name(&self, node: &str, check: &str) -> String {
        deadline(Duration::from_secs(5), || {
            self.records
                .list_events()
                .unwrap()
                .into_iter()
                .find(|e| e.spec.node_name == node && e.spec.check_name == check)
                .map(|e| e.metadata.name)
        })
        .await
        .expect("event created")
    }

    async fn wait_for_phase(&self, name: &str, target: EventPhase) -> HealthEvent {
        deadline(Duration::from_secs(5), || {
            self.records
                .get_event(name)
                .ok()
                .filter(|e| e.status.phase == target)
        })
        .await
        .unwrap_or_else(|| panic!("event {} never reached {}", name, target))
    }

    async fn wait_deleted(&self, name: &str) {
        deadline(Duration::from_secs(5), || {
            match self.records.get_event(name) {
                Err(e) if e.is_not_found() => Some(()),
                _ => None,
            }
        })
        .await
        .unwrap_or_else(|| panic!("event {} never deleted", name));
    }

    fn phases_of(&self, name: &str) -> Vec<EventPhase> {
        self.phase_history
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| *p)
            .collect()
    }

    fn assert_phases_monotone(&self, name: &str) {
        let phases = self.phases_of(name);
        for pair in phases.windows(2) {
            assert!(
                phase::is_forward(pair[0], pair[1]),
                "event {} regressed: {:?}",
                name,
                phases
            );
        }
    }
}

async fn deadline<T>(limit: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if start.elapsed() > limit {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn fatal_signal(node: &str, check: &str, codes: &[u64]) -> HealthSignal {
    HealthSignal {
        version: SIGNAL_SCHEMA_VERSION.to_string(),
        source: "e2e".to_string(),
        node_name: node.to_string(),
        component_class: "GPU".to_string(),
        check_name: check.to_string(),
        is_fatal: true,
        is_healthy: false,
        error_codes: codes.to_vec(),
        recommended_action: RecommendedAction::RestartVm,
        overrides: Default::default(),
        detected_at: None,
        message: "XID error occurred".to_string(),
        unknown: Default::default(),
    }
}

fn healthy_signal(node: &str, check: &str) -> HealthSignal {
    let mut signal = fatal_signal(node, check, &[]);
    signal.is_fatal = false;
    signal.is_healthy = true;
    signal.message = String::new();
    signal
}

#[tokio::test]
async fn test_fatal_xid_full_flow() {
    let harness = Harness::start(&["n1"], RebootPhase::Completed, Duration::from_millis(100));
    harness.cluster.add_pod("n1", "workload", "training-0");

    harness.send(fatal_signal("n1", "GpuXidError", &[79])).await;
    let name = harness.event_name("n1", "GpuXidError").await;

    let event = harness.wait_for_phase(&name, EventPhase::Remediated).await;
    assert!(harness.cluster.is_cordoned("n1"), "node cordoned during flow");
    assert_eq!(harness.cluster.pod_count("n1"), 0, "user pods evicted");

    // Exactly one RebootNode, owned by this event
    let reboots = harness.records.list_reboots().unwrap();
    assert_eq!(reboots.len(), 1);
    assert_eq!(reboots[0].spec.owning_health_event_uid, event.metadata.uid);
    assert_eq!(reboots[0].status.phase, RebootPhase::Completed);

    // Producer reports recovery
    harness.send(healthy_signal("n1", "GpuXidError")).await;
    let event = harness.wait_for_phase(&name, EventPhase::Resolved).await;
    assert!(event.status.resolved_at.is_some());

    // Node handed back, record garbage-collected after retention
    deadline(Duration::from_secs(5), || {
        (!harness.cluster.is_cordoned("n1")).then_some(())
    })
    .await
    .expect("node uncordoned after resolution");
    harness.wait_deleted(&name).await;

    harness.assert_phases_monotone(&name);
    let phases = harness.phases_of(&name);
    for expected in [
        EventPhase::Quarantined,
        EventPhase::Draining,
        EventPhase::Drained,
        EventPhase::Remediated,
        EventPhase::Resolved,
    ] {
        assert!(phases.contains(&expected), "missing {} in {:?}", expected, phases);
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_contact_support_stops_at_drained() {
    let harness = Harness::start(&["n1"], RebootPhase::Completed, Duration::from_millis(100));

    let mut signal = fatal_signal("n1", "GpuXidError", &[145]);
    signal.recommended_action = RecommendedAction::ContactSupport;
    harness.send(signal).await;

    let name = harness.event_name("n1", "GpuXidError").await;
    harness.wait_for_phase(&name, EventPhase::Drained).await;

    // The skip is recorded, and nothing ever creates a reboot record
    deadline(Duration::from_secs(5), || {
        harness
            .records
            .get_event(&name)
            .ok()
            .and_then(|e| e.status.condition(ConditionType::Remediated).cloned())
    })
    .await
    .expect("Remediated condition set");
    let event = harness.records.get_event(&name).unwrap();
    let cond = event.status.condition(ConditionType::Remediated).unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, reason::SKIPPED);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.records.list_reboots().unwrap().is_empty());
    assert_eq!(
        harness.records.get_event(&name).unwrap().status.phase,
        EventPhase::Drained
    );
    assert!(!harness.phases_of(&name).contains(&EventPhase::Remediated));

    // Still resolvable
    harness.send(healthy_signal("n1", "GpuXidError")).await;
    harness.wait_for_phase(&name, EventPhase::Resolved).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_skip_drain_override() {
    let harness = Harness::start(&["n1"], RebootPhase::Completed, Duration::from_millis(100));
    harness.cluster.add_pod("n1", "workload", "training-0");

    let mut signal = fatal_signal("n1", "GpuXidError", &[79]);
    signal.overrides.drain.skip = true;
    harness.send(signal).await;

    let name = harness.event_name("n1", "GpuXidError").await;
    harness.wait_for_phase(&name, EventPhase::Remediated).await;

    // Draining was never observable, pods kept running
    assert!(!harness.phases_of(&name).contains(&EventPhase::Draining));
    assert_eq!(harness.cluster.pod_count("n1"), 1);

    let event = harness.records.get_event(&name).unwrap();
    let cond = event.status.condition(ConditionType::PodsDrained).unwrap();
    assert_eq!(cond.status, ConditionStatus::True);
    assert_eq!(cond.reason, reason::SKIPPED);

    harness.stop().await;
}

#[tokio::test]
async fn test_non_fatal_signal_passes_through_untouched() {
    let harness = Harness::start(&["n1"], RebootPhase::Completed, Duration::from_millis(50));
    harness.cluster.add_pod("n1", "workload", "training-0");

    let mut signal = fatal_signal("n1", "GpuXidError", &[79]);
    signal.is_fatal = false;
    harness.send(signal).await;

    let name = harness.event_name("n1", "GpuXidError").await;
    harness.wait_for_phase(&name, EventPhase::Drained).await;

    assert!(!harness.cluster.is_cordoned("n1"), "node never cordoned");
    assert_eq!(harness.cluster.pod_count("n1"), 1, "no pods evicted");
    assert!(harness.records.list_reboots().unwrap().is_empty());

    harness.send(healthy_signal("n1", "GpuXidError")).await;
    harness.wait_for_phase(&name, EventPhase::Resolved).await;
    harness.wait_deleted(&name).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_duplicate_signals_fold_and_do_not_disturb_the_flow() {
    let harness = Harness::start(&["n1"], RebootPhase::Completed, Duration::from_millis(100));

    for _ in 0..10 {
        harness.send(fatal_signal("n1", "GpuXidError", &[79])).await;
    }

    let name = harness.event_name("n1", "GpuXidError").await;
    harness.wait_for_phase(&name, EventPhase::Remediated).await;

    let events = harness.records.list_events().unwrap();
    assert_eq!(events.len(), 1, "one event for ten duplicate signals");
    assert_eq!(events[0].spec.error_codes, vec![79]);

    harness.assert_phases_monotone(&name);
    assert_eq!(harness.records.list_reboots().unwrap().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_reboot_leaves_event_drained() {
    let harness = Harness::start(&["n1"], RebootPhase::Failed, Duration::from_millis(100));

    harness.send(fatal_signal("n1", "GpuXidError", &[79])).await;
    let name = harness.event_name("n1", "GpuXidError").await;
    harness.wait_for_phase(&name, EventPhase::Drained).await;

    // The reboot fails; the event parks at Drained with the failure recorded
    deadline(Duration::from_secs(5), || {
        harness.records.get_event(&name).ok().and_then(|e| {
            e.status
                .condition(ConditionType::Remediated)
                .filter(|c| c.reason == reason::FAILED)
                .cloned()
        })
    })
    .await
    .expect("failure recorded on condition");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let event = harness.records.get_event(&name).unwrap();
    assert_eq!(event.status.phase, EventPhase::Drained);
    assert_eq!(harness.records.list_reboots().unwrap().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_two_events_share_a_node() {
    let harness = Harness::start(&["n1"], RebootPhase::Completed, Duration::from_secs(3600));

    harness.send(fatal_signal("n1", "GpuXidError", &[79])).await;
    harness.send(fatal_signal("n1", "GpuMemoryError", &[48])).await;

    let xid = harness.event_name("n1", "GpuXidError").await;
    let mem = harness.event_name("n1", "GpuMemoryError").await;
    harness.wait_for_phase(&xid, EventPhase::Remediated).await;
    harness.wait_for_phase(&mem, EventPhase::Remediated).await;

    // Resolving one event keeps the node cordoned for the other
    harness.send(healthy_signal("n1", "GpuXidError")).await;
    harness.wait_for_phase(&xid, EventPhase::Resolved).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.cluster.is_cordoned("n1"));

    // Resolving the last one releases it
    harness.send(healthy_signal("n1", "GpuMemoryError")).await;
    harness.wait_for_phase(&mem, EventPhase::Resolved).await;
    deadline(Duration::from_secs(5), || {
        (!harness.cluster.is_cordoned("n1")).then_some(())
    })
    .await
    .expect("node released after last resolution");

    harness.stop().await;
}
