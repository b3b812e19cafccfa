//! Cloud provider abstraction
//!
//! A provider turns a [`ClusterConfig`] into real infrastructure and back. It
//! owns the provider-specific resource graph; the orchestrator only stores it
//! as opaque JSON inside [`ClusterState`].

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::kubeconfig::Kubeconfig;
use crate::state::{ClusterState, ClusterStatus};
use crate::teardown::TeardownReport;
use crate::Result;

/// Outcome of a successful create
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionedCluster {
    /// Provider resource graph, persisted verbatim
    pub resources: serde_json::Value,
    /// Status observed at the end of create
    pub status: ClusterStatus,
}

/// Requested node pool bounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeScaling {
    /// Minimum node count
    pub min_size: u32,
    /// Maximum node count
    pub max_size: u32,
    /// Desired node count
    pub desired_size: u32,
}

impl NodeScaling {
    /// Create scaling bounds
    pub fn new(min_size: u32, max_size: u32, desired_size: u32) -> Self {
        Self {
            min_size,
            max_size,
            desired_size,
        }
    }
}

/// Infrastructure provider for managed Kubernetes clusters
///
/// Implementations must be safe to call on partially-created graphs:
/// `destroy` tolerates missing fields and already-deleted resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider key under which resources are stored (e.g. "aws")
    fn name(&self) -> &'static str;

    /// Create every resource for the cluster and wait until it is usable
    ///
    /// On failure the error carries whatever part of the graph was created
    /// (see [`crate::Error::partial_resources`]).
    async fn create(&self, config: &ClusterConfig) -> Result<ProvisionedCluster>;

    /// Tear down a resource graph in reverse dependency order
    ///
    /// Never stops at the first failure; every step is recorded.
    async fn destroy(
        &self,
        config: &ClusterConfig,
        resources: &serde_json::Value,
    ) -> TeardownReport;

    /// Change node pool bounds, returning the updated graph
    async fn scale_node_pool(
        &self,
        state: &ClusterState,
        scaling: NodeScaling,
    ) -> Result<serde_json::Value>;

    /// Upgrade the control plane version, returning the updated graph
    async fn upgrade_version(&self, state: &ClusterState, version: &str)
        -> Result<serde_json::Value>;

    /// Query live status for a stored cluster
    async fn refresh_status(&self, state: &ClusterState) -> Result<ClusterStatus>;

    /// Kubeconfig for a stored cluster
    async fn kubeconfig(&self, state: &ClusterState) -> Result<Kubeconfig>;
}
