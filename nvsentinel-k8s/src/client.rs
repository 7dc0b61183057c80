//! Kubernetes client wrapper
//!
//! Thin interface over the kube client for the node and pod operations the
//! controllers need. Callers that must branch on failure kinds (missing
//! node, eviction blocked by a disruption budget) get the raw kube error.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Config};
use serde_json::{json, Value};
use tracing::info;

const FIELD_MANAGER: &str = "nvsentinel";

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new client using in-cluster (or kubeconfig) defaults.
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    /// Create a new client with custom config
    pub async fn with_config(config: Config) -> Result<Self> {
        let client =
            Client::try_from(config).context("Failed to create Kubernetes client from config")?;

        Ok(Self { client })
    }

    /// Wrap an already-built kube client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Get the underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get node API
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Get pods API for a namespace
    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Get all pods API
    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    /// Get a node by name
    pub async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes().get(name).await
    }

    /// Check if the API server is reachable
    pub async fn health_check(&self) -> Result<()> {
        self.nodes()
            .list(&ListParams::default().limit(1))
            .await
            .context("Failed to list nodes")?;
        Ok(())
    }

    /// Merge-patch a node.
    pub async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node, kube::Error> {
        let params = PatchParams::apply(FIELD_MANAGER);
        self.nodes().patch(name, &params, &Patch::Merge(patch)).await
    }

    /// Mark a node unschedulable, attaching the given ownership annotation.
    pub async fn cordon_node(
        &self,
        node_name: &str,
        annotation_key: &str,
    ) -> Result<(), kube::Error> {
        let patch = json!({
            "metadata": {
                "annotations": { annotation_key: "true" }
            },
            "spec": {
                "unschedulable": true
            }
        });

        self.patch_node(node_name, &patch).await?;
        info!(node = node_name, "Node cordoned");
        Ok(())
    }

    /// Mark a node schedulable again and drop the ownership annotation.
    pub async fn uncordon_node(
        &self,
        node_name: &str,
        annotation_key: &str,
    ) -> Result<(), kube::Error> {
        let patch = json!({
            "metadata": {
                "annotations": { annotation_key: null }
            },
            "spec": {
                "unschedulable": false
            }
        });

        self.patch_node(node_name, &patch).await?;
        info!(node = node_name, "Node uncordoned");
        Ok(())
    }

    /// List pods on a specific node
    pub async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, kube::Error> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = self.pods_all().list(&params).await?;
        Ok(pods.items)
    }

    /// Evict a pod via the eviction subresource.
    pub async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.evict(name, &Default::default()).await?;

        info!(namespace = namespace, pod = name, "Pod evicted");
        Ok(())
    }
}
