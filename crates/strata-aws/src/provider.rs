//! AWS implementation of the [`Provider`] trait
//!
//! Sequences the IAM, network and cluster managers. Create runs
//! IAM → network → cluster and stops at the first error, handing back
//! whatever was created. Destroy runs the mirror image and never stops early.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use strata_common::cluster::ClusterConfig;
use strata_common::config::{Settings, Timeouts};
use strata_common::kubeconfig::Kubeconfig;
use strata_common::provider::{NodeScaling, ProvisionedCluster, Provider};
use strata_common::state::{ClusterPhase, ClusterState, ClusterStatus};
use strata_common::teardown::TeardownReport;
use strata_common::{Error, Result};

use crate::api::{Ec2Api, EksApi, IamApi};
use crate::cluster::{generate_kubeconfig, ClusterManager};
use crate::iam::IamManager;
use crate::network::NetworkManager;
use crate::resources::AwsResources;

/// Provider key under which the AWS graph is stored
pub const PROVIDER_NAME: &str = "aws";

/// Cloud API clients for one region
#[derive(Clone)]
pub struct AwsClients {
    /// IAM client
    pub iam: Arc<dyn IamApi>,
    /// EC2 client
    pub ec2: Arc<dyn Ec2Api>,
    /// EKS client
    pub eks: Arc<dyn EksApi>,
}

impl AwsClients {
    /// Use one value for all three services
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: IamApi + Ec2Api + EksApi + 'static,
    {
        Self {
            iam: client.clone(),
            ec2: client.clone(),
            eks: client,
        }
    }
}

/// AWS infrastructure provider
pub struct AwsProvider {
    iam: IamManager,
    network: NetworkManager,
    cluster: ClusterManager,
}

impl AwsProvider {
    /// Build a provider from API clients and runtime settings
    pub fn new(clients: AwsClients, settings: &Settings) -> Self {
        Self::with_timeouts(clients, &settings.timeouts)
    }

    /// Build a provider with explicit wait budgets
    pub fn with_timeouts(clients: AwsClients, timeouts: &Timeouts) -> Self {
        Self {
            iam: IamManager::new(clients.iam, timeouts),
            network: NetworkManager::new(clients.ec2, timeouts),
            cluster: ClusterManager::new(clients.eks, timeouts),
        }
    }

    fn graph(state: &ClusterState) -> Result<AwsResources> {
        AwsResources::from_value(state.provider_resources()?)
    }
}

#[async_trait]
impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    #[instrument(skip_all, fields(cluster = %config.name))]
    async fn create(&self, config: &ClusterConfig) -> Result<ProvisionedCluster> {
        let mut graph = AwsResources::default();
        let name = &config.name;

        if let Err(e) = self.iam.create(config, &mut graph.iam).await {
            return Err(Error::create_failed(name, "iam", e, graph.to_value()));
        }
        if let Err(e) = self.network.create(config, &mut graph.networking).await {
            return Err(Error::create_failed(name, "network", e, graph.to_value()));
        }
        if let Err(e) = self
            .cluster
            .create(config, &graph.networking, &graph.iam, &mut graph.cluster)
            .await
        {
            return Err(Error::create_failed(name, "cluster", e, graph.to_value()));
        }

        let mut status = ClusterStatus::new(ClusterPhase::Active, "cluster ready");
        status.ready = true;
        status.endpoint = graph
            .cluster
            .control_plane
            .as_ref()
            .and_then(|cp| cp.endpoint.clone());
        status.nodes_total = graph
            .cluster
            .node_groups
            .iter()
            .map(|g| g.scaling.desired_size)
            .sum();
        status.nodes_ready = status.nodes_total;

        info!(endpoint = ?status.endpoint, "Cluster created");
        Ok(ProvisionedCluster {
            resources: graph.to_value(),
            status,
        })
    }

    #[instrument(skip_all, fields(cluster = %config.name))]
    async fn destroy(&self, config: &ClusterConfig, resources: &serde_json::Value) -> TeardownReport {
        let graph = match AwsResources::from_value(resources) {
            Ok(graph) => graph,
            Err(e) => {
                let mut report = TeardownReport::new();
                report.failed("resource-graph", config.name.as_str(), e);
                return report;
            }
        };

        let mut report = TeardownReport::new();
        info!("Deleting cluster resources");
        report.extend(self.cluster.delete(&graph.cluster).await);
        info!("Deleting network resources");
        report.extend(self.network.delete(&graph.networking).await);
        info!("Deleting IAM resources");
        report.extend(self.iam.delete(&graph.iam).await);

        if !report.is_clean() {
            warn!(failed = report.failures().count(), "Teardown left resources behind");
        }
        report
    }

    async fn scale_node_pool(
        &self,
        state: &ClusterState,
        scaling: NodeScaling,
    ) -> Result<serde_json::Value> {
        let mut graph = Self::graph(state)?;
        self.cluster
            .update_node_group(&mut graph.cluster, scaling)
            .await?;
        Ok(graph.to_value())
    }

    async fn upgrade_version(
        &self,
        state: &ClusterState,
        version: &str,
    ) -> Result<serde_json::Value> {
        let mut graph = Self::graph(state)?;
        self.cluster
            .update_cluster_version(&mut graph.cluster, version)
            .await?;
        Ok(graph.to_value())
    }

    async fn refresh_status(&self, state: &ClusterState) -> Result<ClusterStatus> {
        let graph = Self::graph(state)?;
        self.cluster.describe_status(&graph.cluster).await
    }

    async fn kubeconfig(&self, state: &ClusterState) -> Result<Kubeconfig> {
        let graph = Self::graph(state)?;
        let control_plane = graph
            .cluster
            .control_plane
            .as_ref()
            .ok_or_else(|| Error::not_found("control plane", state.name()))?;
        generate_kubeconfig(control_plane, &state.config.region)
    }
}
