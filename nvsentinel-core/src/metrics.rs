//! Prometheus metrics
//!
//! Every component takes the registry it should register against, so tests
//! inject a fresh `prometheus::Registry` and production wires them all into
//! the one served over HTTP.

use prometheus::{IntCounterVec, Opts, Registry};

const NAMESPACE: &str = "nvsentinel";

fn counter_vec(
    registry: &Registry,
    subsystem: &str,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE).subsystem(subsystem),
        labels,
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Quarantine controller counters.
pub struct QuarantineMetrics {
    /// outcome: success, failed, skipped
    pub actions: IntCounterVec,
}

impl QuarantineMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            actions: counter_vec(
                registry,
                "quarantine_controller",
                "actions_total",
                "Total number of quarantine actions taken by outcome",
                &["node", "outcome"],
            )?,
        })
    }
}

/// Drain controller counters.
pub struct DrainMetrics {
    /// outcome: evicted, failed, skipped, completed
    pub actions: IntCounterVec,
}

impl DrainMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            actions: counter_vec(
                registry,
                "drain_controller",
                "actions_total",
                "Total number of drain actions taken by outcome",
                &["node", "outcome"],
            )?,
        })
    }
}

/// TTL controller counters.
pub struct TtlMetrics {
    pub deletions: IntCounterVec,
}

impl TtlMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            deletions: counter_vec(
                registry,
                "ttl_controller",
                "deletions_total",
                "Total number of HealthEvents deleted by the TTL controller",
                &["node", "phase"],
            )?,
        })
    }
}

/// Remediation controller counters.
pub struct RemediationMetrics {
    pub actions: IntCounterVec,
    pub failures: IntCounterVec,
}

impl RemediationMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            actions: counter_vec(
                registry,
                "remediation_controller",
                "actions_total",
                "Total number of remediation actions executed",
                &["node", "strategy"],
            )?,
            failures: counter_vec(
                registry,
                "remediation_controller",
                "failures_total",
                "Total number of failed remediation attempts",
                &["node", "strategy"],
            )?,
        })
    }
}

/// Publisher counters.
pub struct PublisherMetrics {
    /// Signals dropped after exhausting retries
    pub errors: IntCounterVec,
}

impl PublisherMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            errors: counter_vec(
                registry,
                "publisher",
                "errors_total",
                "Producer signals dropped after exhausting retries",
                &["node"],
            )?,
        })
    }
}

/// Shared reconciler-runner counters.
pub struct RunnerMetrics {
    pub invariant_violations: IntCounterVec,
}

impl RunnerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            invariant_violations: counter_vec(
                registry,
                "controller",
                "invariant_violations_total",
                "Status updates rejected for violating lifecycle invariants",
                &["controller"],
            )?,
        })
    }
}
