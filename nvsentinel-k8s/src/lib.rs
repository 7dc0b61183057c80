//! NVSentinel Kubernetes Integration
//!
//! Provides the kube client wrapper and the node/pod operations behind the
//! controller seams, plus gang discovery for workload-group reporting
//! during drains.

pub mod client;
pub mod gang;
pub mod node_ops;

pub use client::K8sClient;
pub use gang::{CompositeDiscoverer, GangDiscoverer, GangInfo, PeerInfo};
pub use node_ops::NodeOperator;
