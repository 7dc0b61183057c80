//! Node operations
//!
//! Implements the controller seams against a real cluster: cordon with an
//! ownership annotation, annotation-gated uncordon, and pod listing plus
//! eviction with the drain exclusion rules.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use nvsentinel_core::controllers::{EvictError, NodeAdmin, NodeOpError, PodEvictor, PodRef};

use crate::client::K8sClient;
use crate::gang::{CompositeDiscoverer, GangDiscoverer};

/// Ownership mark written when we cordon a node. A node cordoned by anyone
/// else never gets this annotation and is never uncordoned by us.
pub const QUARANTINE_ANNOTATION: &str = "nvsentinel.nvidia.com/quarantined";

/// Annotation kubelet puts on mirror pods for static pods.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

fn status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn node_err(node: &str, err: kube::Error) -> NodeOpError {
    if status_code(&err) == Some(404) {
        NodeOpError::NotFound(node.to_string())
    } else {
        NodeOpError::Transient(format!("node {}: {}", node, err))
    }
}

/// Node operator backing the quarantine, drain and TTL controllers.
pub struct NodeOperator {
    client: K8sClient,
    system_namespaces: BTreeSet<String>,
    gangs: Arc<CompositeDiscoverer>,
    dry_run: bool,
}

impl NodeOperator {
    pub fn new(client: K8sClient, system_namespaces: BTreeSet<String>, dry_run: bool) -> Self {
        let gangs = Arc::new(CompositeDiscoverer::standard(client.clone()));
        Self {
            client,
            system_namespaces,
            gangs,
            dry_run,
        }
    }

    /// Drain exclusion rules: skip protected namespaces, mirror pods,
    /// daemonset members and pods already terminating.
    fn is_evictable(&self, pod: &Pod) -> bool {
        let metadata = &pod.metadata;

        if let Some(namespace) = &metadata.namespace {
            if self.system_namespaces.contains(namespace) {
                return false;
            }
        }

        if let Some(annotations) = &metadata.annotations {
            if annotations.contains_key(MIRROR_POD_ANNOTATION) {
                return false;
            }
        }

        if let Some(owner_refs) = &metadata.owner_references {
            if owner_refs.iter().any(|owner| owner.kind == "DaemonSet") {
                return false;
            }
        }

        if metadata.deletion_timestamp.is_some() {
            return false;
        }

        true
    }

    /// Report gangs touched by a drain: peers on other nodes keep running
    /// degraded, which operators want to see.
    async fn report_gangs(&self, node: &str, pods: &[Pod]) {
        let mut seen = BTreeSet::new();

        for pod in pods {
            let Some(gang_id) = self.gangs.extract_gang_id(pod) else {
                continue;
            };
            if !seen.insert(gang_id.clone()) {
                continue;
            }

            match self.gangs.discover_peers(pod).await {
                Ok(Some(info)) => {
                    let elsewhere = info
                        .peers
                        .iter()
                        .filter(|p| p.node_name != node)
                        .count();
                    debug!(
                        node = %node,
                        gang = %info.gang_id,
                        members = info.peers.len(),
                        peers_on_other_nodes = elsewhere,
                        "Drain touches workload group"
                    );
                }
                Ok(None) => {}
                Err(e) => debug!(node = %node, gang = %gang_id, error = %e, "Gang discovery failed"),
            }
        }
    }
}

#[async_trait]
impl NodeAdmin for NodeOperator {
    async fn cordon(&self, node: &str) -> Result<(), NodeOpError> {
        let current = self
            .client
            .get_node(node)
            .await
            .map_err(|e| node_err(node, e))?;

        let unschedulable = current
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);

        if unschedulable {
            // Already cordoned; if the mark is not ours, leave it unowned
            debug!(node = %node, "Node already unschedulable");
            return Ok(());
        }

        if self.dry_run {
            info!(node = %node, "[DRY-RUN] Would cordon node");
            return Ok(());
        }

        self.client
            .cordon_node(node, QUARANTINE_ANNOTATION)
            .await
            .map_err(|e| node_err(node, e))
    }

    async fn uncordon_owned(&self, node: &str) -> Result<bool, NodeOpError> {
        let current = self
            .client
            .get_node(node)
            .await
            .map_err(|e| node_err(node, e))?;

        let owned = current
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(QUARANTINE_ANNOTATION))
            .unwrap_or(false);

        if !owned {
            debug!(node = %node, "Node not cordoned by us, leaving as-is");
            return Ok(false);
        }

        if self.dry_run {
            info!(node = %node, "[DRY-RUN] Would uncordon node");
            return Ok(true);
        }

        self.client
            .uncordon_node(node, QUARANTINE_ANNOTATION)
            .await
            .map_err(|e| node_err(node, e))?;
        Ok(true)
    }
}

#[async_trait]
impl PodEvictor for NodeOperator {
    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>, NodeOpError> {
        let pods = self
            .client
            .list_pods_on_node(node)
            .await
            .map_err(|e| node_err(node, e))?;

        let evictable: Vec<Pod> = pods.into_iter().filter(|p| self.is_evictable(p)).collect();
        self.report_gangs(node, &evictable).await;

        Ok(evictable
            .iter()
            .map(|p| PodRef {
                namespace: p.metadata.namespace.clone().unwrap_or_default(),
                name: p.metadata.name.clone().unwrap_or_default(),
                gang_id: self.gangs.extract_gang_id(p),
            })
            .collect())
    }

    async fn evict(&self, pod: &PodRef) -> Result<(), EvictError> {
        if self.dry_run {
            info!(namespace = %pod.namespace, pod = %pod.name, "[DRY-RUN] Would evict pod");
            return Ok(());
        }

        match self.client.evict_pod(&pod.namespace, &pod.name).await {
            Ok(()) => Ok(()),
            Err(e) => match status_code(&e) {
                // Disruption budget rejections come back as 429
                Some(429) => Err(EvictError::Blocked(format!(
                    "{}/{}: {}",
                    pod.namespace, pod.name, e
                ))),
                Some(404) => Err(EvictError::Gone(format!("{}/{}", pod.namespace, pod.name))),
                _ => {
                    warn!(namespace = %pod.namespace, pod = %pod.name, error = %e, "Eviction failed");
                    Err(EvictError::Transient(format!(
                        "{}/{}: {}",
                        pod.namespace, pod.name, e
                    )))
                }
            },
        }
    }
}
