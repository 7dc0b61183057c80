//! Configuration
//!
//! Loaded from YAML with serde defaults for every section, so a missing or
//! partial file still yields a runnable configuration. Durations use
//! humantime strings ("24h", "30s").

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which backend holds the cluster-scoped records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Embedded in-memory store
    #[default]
    InMemory,
    /// External key-value cluster
    External,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub mode: StorageMode,

    /// Endpoint of the external cluster; required when mode is external
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Retention of resolved HealthEvents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(with = "humantime_serde", default = "default_resolved_retention")]
    pub resolved_retention: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            resolved_retention: default_resolved_retention(),
        }
    }
}

/// Drain behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Namespaces whose pods are never evicted
    #[serde(default = "default_system_namespaces")]
    pub system_namespaces: BTreeSet<String>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            system_namespaces: default_system_namespaces(),
        }
    }
}

/// Signal classification overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalConfig {
    /// XID codes to treat as ignored in addition to the built-in table
    #[serde(default)]
    pub additional_ignored_codes: Vec<u64>,
}

/// Reconciliation tuning shared by all controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Per-reconcile deadline
    #[serde(with = "humantime_serde", default = "default_reconcile_timeout")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Worker pool size per controller
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeout: default_reconcile_timeout(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            workers: default_workers(),
        }
    }
}

/// Publisher retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_publisher_attempts")]
    pub max_attempts: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_publisher_attempts(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Cloud maintenance poller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Disabled unless the cluster surfaces maintenance notices
    #[serde(default)]
    pub enabled: bool,

    #[serde(with = "humantime_serde", default = "default_maintenance_interval")]
    pub poll_interval: Duration,

    /// Bound on concurrent per-node queries during one poll
    #[serde(default = "default_maintenance_fan_out")]
    pub fan_out: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_maintenance_interval(),
            fan_out: default_maintenance_fan_out(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ttl: TtlConfig,

    #[serde(default)]
    pub drain: DrainConfig,

    #[serde(default)]
    pub signal: SignalConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Dry run mode - log node/pod actions but don't execute
    #[serde(default)]
    pub dry_run: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.mode == StorageMode::External && self.storage.endpoint.is_none() {
            anyhow::bail!("storage.endpoint is required when storage.mode is external");
        }
        if self.ttl.resolved_retention.is_zero() {
            anyhow::bail!("ttl.resolved_retention must be > 0");
        }
        if self.reconcile.timeout.is_zero() {
            anyhow::bail!("reconcile.timeout must be > 0");
        }
        if self.reconcile.initial_backoff.is_zero() {
            anyhow::bail!("reconcile.initial_backoff must be > 0");
        }
        if self.reconcile.initial_backoff > self.reconcile.max_backoff {
            anyhow::bail!("reconcile.initial_backoff must not exceed reconcile.max_backoff");
        }
        if self.reconcile.workers == 0 {
            anyhow::bail!("reconcile.workers must be > 0");
        }
        if self.publisher.max_attempts == 0 {
            anyhow::bail!("publisher.max_attempts must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        if self.maintenance.enabled && self.maintenance.fan_out == 0 {
            anyhow::bail!("maintenance.fan_out must be > 0 when the poller is enabled");
        }
        Ok(())
    }
}

// Default value functions
fn default_resolved_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_system_namespaces() -> BTreeSet<String> {
    BTreeSet::from(["kube-system".to_string()])
}

fn default_reconcile_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_workers() -> usize {
    4
}

fn default_publisher_attempts() -> u32 {
    5
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_maintenance_fan_out() -> usize {
    8
}

fn default_true() -> bool {
    true
}
