//! Gang discovery
//!
//! Distributed training jobs schedule pods as gangs; evicting one member
//! degrades the whole group, possibly across nodes. A single capability
//! identifies a pod's gang and finds its peers, with concrete
//! implementations for Volcano, Kueue and plain labels compiled in behind
//! a composite that tries them in order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tracing::debug;

use crate::client::K8sClient;

/// Annotation used by Volcano to identify pod groups.
pub const VOLCANO_POD_GROUP_ANNOTATION: &str = "volcano.sh/pod-group";

/// Label used by Kueue to identify workloads.
pub const KUEUE_WORKLOAD_NAME_LABEL: &str = "kueue.x-k8s.io/workload-name";

/// Default label keys for label-based gang identification.
pub const DEFAULT_GANG_ID_LABEL: &str = "app.kubernetes.io/gang-id";
pub const DEFAULT_GANG_SIZE_LABEL: &str = "app.kubernetes.io/gang-size";

/// One gang member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub pod_name: String,
    pub pod_ip: String,
    pub node_name: String,
    pub namespace: String,
}

/// The full gang picture for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GangInfo {
    pub gang_id: String,
    /// Expected member count when the scheduler exposes it.
    pub expected_min_count: Option<usize>,
    pub peers: Vec<PeerInfo>,
}

/// Discovers the gang a pod belongs to. `can_handle` and `extract_gang_id`
/// are cheap and local; `discover_peers` goes to the API server.
#[async_trait]
pub trait GangDiscoverer: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, pod: &Pod) -> bool;

    /// Gang identifier for the pod, None for singletons.
    fn extract_gang_id(&self, pod: &Pod) -> Option<String>;

    /// All pods in the same gang; None when the pod is a singleton.
    async fn discover_peers(&self, pod: &Pod) -> Result<Option<GangInfo>>;
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

/// Members are running or pending pods; completed ones no longer count.
fn is_member(pod: &Pod) -> bool {
    matches!(
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or(""),
        "Running" | "Pending"
    )
}

fn to_peers(pods: Vec<Pod>) -> Vec<PeerInfo> {
    pods.iter()
        .filter(|p| is_member(p))
        .map(|p| PeerInfo {
            pod_name: p.metadata.name.clone().unwrap_or_default(),
            pod_ip: p
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            node_name: p
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            namespace: p.metadata.namespace.clone().unwrap_or_default(),
        })
        .collect()
}

/// Volcano: pods carry the pod-group annotation.
pub struct VolcanoDiscoverer {
    client: K8sClient,
}

impl VolcanoDiscoverer {
    pub fn new(client: K8sClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GangDiscoverer for VolcanoDiscoverer {
    fn name(&self) -> &'static str {
        "volcano"
    }

    fn can_handle(&self, pod: &Pod) -> bool {
        annotation(pod, VOLCANO_POD_GROUP_ANNOTATION).is_some()
    }

    fn extract_gang_id(&self, pod: &Pod) -> Option<String> {
        let group = annotation(pod, VOLCANO_POD_GROUP_ANNOTATION)?;
        Some(format!("volcano-{}-{}", pod_namespace(pod), group))
    }

    async fn discover_peers(&self, pod: &Pod) -> Result<Option<GangInfo>> {
        let Some(group) = annotation(pod, VOLCANO_POD_GROUP_ANNOTATION) else {
            return Ok(None);
        };
        let gang_id = self.extract_gang_id(pod).unwrap_or_default();
        let namespace = pod_namespace(pod);

        // PodGroup membership is an annotation, so list the namespace and
        // filter; annotations are not selectable server-side.
        let pods: Api<Pod> = self.client.pods(namespace);
        let listed = pods
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list pods in {}", namespace))?;

        let members: Vec<Pod> = listed
            .items
            .into_iter()
            .filter(|p| annotation(p, VOLCANO_POD_GROUP_ANNOTATION) == Some(group))
            .collect();

        debug!(gang = %gang_id, members = members.len(), "Discovered Volcano gang");
        Ok(Some(GangInfo {
            gang_id,
            expected_min_count: None,
            peers: to_peers(members),
        }))
    }
}

/// Kueue: pods carry the workload-name label.
pub struct KueueDiscoverer {
    client: K8sClient,
}

impl KueueDiscoverer {
    pub fn new(client: K8sClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GangDiscoverer for KueueDiscoverer {
    fn name(&self) -> &'static str {
        "kueue"
    }

    fn can_handle(&self, pod: &Pod) -> bool {
        label(pod, KUEUE_WORKLOAD_NAME_LABEL).is_some()
    }

    fn extract_gang_id(&self, pod: &Pod) -> Option<String> {
        let workload = label(pod, KUEUE_WORKLOAD_NAME_LABEL)?;
        Some(format!("kueue-{}-{}", pod_namespace(pod), workload))
    }

    async fn discover_peers(&self, pod: &Pod) -> Result<Option<GangInfo>> {
        let Some(workload) = label(pod, KUEUE_WORKLOAD_NAME_LABEL) else {
            return Ok(None);
        };
        let gang_id = self.extract_gang_id(pod).unwrap_or_default();
        let namespace = pod_namespace(pod);

        let selector = format!("{}={}", KUEUE_WORKLOAD_NAME_LABEL, workload);
        let pods: Api<Pod> = self.client.pods(namespace);
        let listed = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .with_context(|| format!("failed to list pods with selector {}", selector))?;

        debug!(gang = %gang_id, members = listed.items.len(), "Discovered Kueue gang");
        Ok(Some(GangInfo {
            gang_id,
            expected_min_count: None,
            peers: to_peers(listed.items),
        }))
    }
}

/// Label-based discovery for custom schedulers: a gang-id label, plus an
/// optional gang-size label for the expected member count.
pub struct LabelDiscoverer {
    client: K8sClient,
    gang_id_label: String,
    gang_size_label: String,
}

impl LabelDiscoverer {
    pub fn new(client: K8sClient) -> Self {
        Self::with_labels(client, DEFAULT_GANG_ID_LABEL, DEFAULT_GANG_SIZE_LABEL)
    }

    pub fn with_labels(client: K8sClient, gang_id_label: &str, gang_size_label: &str) -> Self {
        Self {
            client,
            gang_id_label: gang_id_label.to_string(),
            gang_size_label: gang_size_label.to_string(),
        }
    }
}

#[async_trait]
impl GangDiscoverer for LabelDiscoverer {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn can_handle(&self, pod: &Pod) -> bool {
        label(pod, &self.gang_id_label).is_some()
    }

    fn extract_gang_id(&self, pod: &Pod) -> Option<String> {
        let gang = label(pod, &self.gang_id_label)?;
        Some(format!("labels-{}-{}", pod_namespace(pod), gang))
    }

    async fn discover_peers(&self, pod: &Pod) -> Result<Option<GangInfo>> {
        let Some(gang) = label(pod, &self.gang_id_label) else {
            return Ok(None);
        };
        let gang_id = self.extract_gang_id(pod).unwrap_or_default();
        let namespace = pod_namespace(pod);

        let expected_min_count = label(pod, &self.gang_size_label).and_then(|v| v.parse().ok());

        let selector = format!("{}={}", self.gang_id_label, gang);
        let pods: Api<Pod> = self.client.pods(namespace);
        let listed = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .with_context(|| format!("failed to list pods with selector {}", selector))?;

        debug!(gang = %gang_id, members = listed.items.len(), "Discovered labelled gang");
        Ok(Some(GangInfo {
            gang_id,
            expected_min_count,
            peers: to_peers(listed.items),
        }))
    }
}

/// Tries each discoverer in order; the first that can handle the pod wins.
pub struct CompositeDiscoverer {
    discoverers: Vec<Box<dyn GangDiscoverer>>,
}

impl CompositeDiscoverer {
    pub fn new(discoverers: Vec<Box<dyn GangDiscoverer>>) -> Self {
        Self { discoverers }
    }

    /// The standard chain: Volcano, then Kueue, then plain labels.
    pub fn standard(client: K8sClient) -> Self {
        Self::new(vec![
            Box::new(VolcanoDiscoverer::new(client.clone())),
            Box::new(KueueDiscoverer::new(client.clone())),
            Box::new(LabelDiscoverer::new(client)),
        ])
    }

    fn active(&self, pod: &Pod) -> Option<&dyn GangDiscoverer> {
        self.discoverers
            .iter()
            .find(|d| d.can_handle(pod))
            .map(|d| d.as_ref())
    }
}

#[async_trait]
impl GangDiscoverer for CompositeDiscoverer {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn can_handle(&self, pod: &Pod) -> bool {
        self.active(pod).is_some()
    }

    fn extract_gang_id(&self, pod: &Pod) -> Option<String> {
        self.active(pod)?.extract_gang_id(pod)
    }

    async fn discover_peers(&self, pod: &Pod) -> Result<Option<GangInfo>> {
        match self.active(pod) {
            Some(discoverer) => discoverer.discover_peers(pod).await,
            // No discoverer claims it: a singleton
            None => Ok(None),
        }
    }
}
