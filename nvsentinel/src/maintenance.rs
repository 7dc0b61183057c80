//! Cloud maintenance poller
//!
//! Cloud providers schedule host maintenance that takes GPU nodes down with
//! them. This producer polls per-node maintenance state on a fixed interval
//! and emits fatal health signals so affected nodes are quarantined and
//! drained ahead of the window. One poll fans out the per-node queries with
//! a bounded number of concurrent lookups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use nvsentinel_core::event::RecommendedAction;
use nvsentinel_core::signal::{HealthSignal, SIGNAL_SCHEMA_VERSION};
use nvsentinel_k8s::K8sClient;

/// Producer identity stamped on emitted signals.
pub const SOURCE: &str = "csp-health-monitor";

/// Check name for maintenance-driven events.
pub const CHECK_NAME: &str = "CloudMaintenance";

/// Node annotation carrying a pending maintenance notice.
pub const MAINTENANCE_ANNOTATION: &str = "maintenance.nvsentinel.nvidia.com/pending";

/// A pending maintenance notice for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceNotice {
    /// Provider-specific kind, e.g. "host-reboot"
    pub kind: String,
    pub not_before: Option<DateTime<Utc>>,
    pub description: String,
}

/// Per-node maintenance lookup. The kube-backed implementation reads a node
/// annotation; cloud-API implementations plug in the same way.
#[async_trait]
pub trait MaintenanceApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<String>>;

    async fn pending_maintenance(&self, node: &str) -> Result<Option<MaintenanceNotice>>;
}

/// Maintenance state surfaced through node annotations.
pub struct NodeAnnotationApi {
    client: K8sClient,
}

impl NodeAnnotationApi {
    pub fn new(client: K8sClient) -> Self {
        Self { client }
    }

    fn notice_from(node: &Node) -> Option<MaintenanceNotice> {
        let value = node
            .metadata
            .annotations
            .as_ref()?
            .get(MAINTENANCE_ANNOTATION)?;
        if value.is_empty() {
            return None;
        }

        // "<kind>;<rfc3339 deadline>" with both parts optional
        let (kind, not_before) = match value.split_once(';') {
            Some((kind, deadline)) => (
                kind.to_string(),
                DateTime::parse_from_rfc3339(deadline)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
            ),
            None => (value.clone(), None),
        };

        Some(MaintenanceNotice {
            kind,
            not_before,
            description: value.clone(),
        })
    }
}

#[async_trait]
impl MaintenanceApi for NodeAnnotationApi {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        let nodes = self.client.nodes().list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .iter()
            .filter_map(|n| n.metadata.name.clone())
            .collect())
    }

    async fn pending_maintenance(&self, node: &str) -> Result<Option<MaintenanceNotice>> {
        let node = self.client.get_node(node).await?;
        Ok(Self::notice_from(&node))
    }
}

/// Periodic poller emitting maintenance signals into the publisher.
pub struct MaintenancePoller {
    api: Arc<dyn MaintenanceApi>,
    signals: mpsc::Sender<HealthSignal>,
    poll_interval: Duration,
    fan_out: usize,
}

impl MaintenancePoller {
    pub fn new(
        api: Arc<dyn MaintenanceApi>,
        signals: mpsc::Sender<HealthSignal>,
        poll_interval: Duration,
        fan_out: usize,
    ) -> Self {
        Self {
            api,
            signals,
            poll_interval,
            fan_out: fan_out.max(1),
        }
    }

    /// Poll until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.poll_interval,
            fan_out = self.fan_out,
            "Starting cloud maintenance poller"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Maintenance poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, maintenance poller exiting");
                        return;
                    }
                }
            }
        }
    }

    /// One poll: list nodes, then query each with bounded concurrency.
    pub async fn poll_once(&self) -> Result<()> {
        let nodes = self.api.list_nodes().await?;
        debug!(nodes = nodes.len(), "Polling nodes for maintenance");

        let semaphore = Arc::new(Semaphore::new(self.fan_out));
        let mut queries = JoinSet::new();

        for node in nodes {
            let api = self.api.clone();
            let semaphore = semaphore.clone();
            queries.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                (node.clone(), api.pending_maintenance(&node).await)
            });
        }

        while let Some(joined) = queries.join_next().await {
            let (node, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Maintenance query task failed");
                    continue;
                }
            };

            match result {
                Ok(Some(notice)) => {
                    info!(node = %node, kind = %notice.kind, "Maintenance pending, emitting signal");
                    if self.signals.send(self.to_signal(&node, &notice)).await.is_err() {
                        warn!("Signal channel closed, dropping maintenance signal");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(node = %node, error = %e, "Maintenance lookup failed"),
            }
        }

        Ok(())
    }

    fn to_signal(&self, node: &str, notice: &MaintenanceNotice) -> HealthSignal {
        HealthSignal {
            version: SIGNAL_SCHEMA_VERSION.to_string(),
            source: SOURCE.to_string(),
            node_name: node.to_string(),
            component_class: "GPU".to_string(),
            check_name: CHECK_NAME.to_string(),
            is_fatal: true,
            is_healthy: false,
            error_codes: Vec::new(),
            // The provider reboots the host itself; we only move work away
            recommended_action: RecommendedAction::NoAction,
            overrides: Default::default(),
            detected_at: Some(Utc::now()),
            message: format!("{} maintenance pending: {}", notice.kind, notice.description),
            unknown: Default::default(),
        }
    }
}
