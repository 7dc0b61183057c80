//! Fake cluster seams
//!
//! In-memory implementations of the NodeAdmin and PodEvictor capabilities,
//! used by controller tests and by local development without a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::controllers::{EvictError, NodeAdmin, NodeOpError, PodEvictor, PodRef};
use crate::event::HealthEvent;

#[derive(Debug, Clone, Default)]
struct FakeNode {
    unschedulable: bool,
    owned: bool,
    pods: Vec<PodRef>,
}

/// A toy cluster: nodes with a cordon flag, an ownership mark, and a pod
/// list. Evictions remove pods immediately unless the pod is marked blocked.
pub struct FakeCluster {
    nodes: Mutex<HashMap<String, FakeNode>>,
    blocked_pods: Mutex<Vec<String>>,
    cordon_calls: AtomicUsize,
    evict_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn new(node_names: &[&str]) -> Self {
        let nodes = node_names
            .iter()
            .map(|n| (n.to_string(), FakeNode::default()))
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            blocked_pods: Mutex::new(Vec::new()),
            cordon_calls: AtomicUsize::new(0),
            evict_calls: AtomicUsize::new(0),
        }
    }

    pub fn add_pod(&self, node: &str, namespace: &str, name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes
            .get_mut(node)
            .expect("unknown fake node")
            .pods
            .push(PodRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
                gang_id: None,
            });
    }

    /// Mark a pod so evictions against it are rejected, as a
    /// PodDisruptionBudget would.
    pub fn block_pod(&self, name: &str) {
        self.blocked_pods.lock().unwrap().push(name.to_string());
    }

    pub fn unblock_pod(&self, name: &str) {
        self.blocked_pods.lock().unwrap().retain(|p| p != name);
    }

    /// Cordon the node out-of-band, as an operator would with kubectl.
    pub fn cordon_externally(&self, node: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.get_mut(node).expect("unknown fake node").unschedulable = true;
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .map(|n| n.unschedulable)
            .unwrap_or(false)
    }

    pub fn is_owned(&self, node: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .map(|n| n.owned)
            .unwrap_or(false)
    }

    pub fn pod_count(&self, node: &str) -> usize {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .map(|n| n.pods.len())
            .unwrap_or(0)
    }

    pub fn cordon_calls(&self) -> usize {
        self.cordon_calls.load(Ordering::SeqCst)
    }

    pub fn evict_calls(&self) -> usize {
        self.evict_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeAdmin for FakeCluster {
    async fn cordon(&self, node: &str) -> Result<(), NodeOpError> {
        self.cordon_calls.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().unwrap();
        let entry = nodes
            .get_mut(node)
            .ok_or_else(|| NodeOpError::NotFound(node.to_string()))?;

        // A node somebody else cordoned stays theirs
        if !entry.unschedulable {
            entry.unschedulable = true;
            entry.owned = true;
        }
        Ok(())
    }

    async fn uncordon_owned(&self, node: &str) -> Result<bool, NodeOpError> {
        let mut nodes = self.nodes.lock().unwrap();
        let entry = nodes
            .get_mut(node)
            .ok_or_else(|| NodeOpError::NotFound(node.to_string()))?;

        if !entry.owned {
            return Ok(false);
        }
        entry.unschedulable = false;
        entry.owned = false;
        Ok(true)
    }
}

#[async_trait]
impl PodEvictor for FakeCluster {
    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>, NodeOpError> {
        let nodes = self.nodes.lock().unwrap();
        let entry = nodes
            .get(node)
            .ok_or_else(|| NodeOpError::NotFound(node.to_string()))?;
        Ok(entry.pods.clone())
    }

    async fn evict(&self, pod: &PodRef) -> Result<(), EvictError> {
        self.evict_calls.fetch_add(1, Ordering::SeqCst);

        if self.blocked_pods.lock().unwrap().contains(&pod.name) {
            return Err(EvictError::Blocked(format!(
                "pod {}/{} protected by disruption budget",
                pod.namespace, pod.name
            )));
        }

        let mut nodes = self.nodes.lock().unwrap();
        let mut found = false;
        for node in nodes.values_mut() {
            let before = node.pods.len();
            node.pods.retain(|p| p != pod);
            found |= node.pods.len() != before;
        }

        if found {
            Ok(())
        } else {
            Err(EvictError::Gone(format!("{}/{}", pod.namespace, pod.name)))
        }
    }
}

/// A fatal test event with sensible defaults.
pub fn fatal_event(name: &str, node: &str) -> HealthEvent {
    let mut event = HealthEvent::default();
    event.metadata.name = name.to_string();
    event.metadata.uid = format!("uid-{}", name);
    event.spec.source = "e2e".to_string();
    event.spec.node_name = node.to_string();
    event.spec.component_class = "GPU".to_string();
    event.spec.check_name = "GpuXidError".to_string();
    event.spec.is_fatal = true;
    event.spec.error_codes = vec![79];
    event.spec.recommended_action = crate::event::RecommendedAction::RestartVm;
    event.spec.message = "XID error occurred".to_string();
    event
}
