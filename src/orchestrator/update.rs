//! In-place cluster updates

use std::sync::Arc;

use tracing::{error, info, instrument};

use strata_common::cluster::NodeConfig;
use strata_common::provider::{NodeScaling, Provider};
use strata_common::state::{ClusterPhase, ClusterState};
use strata_common::{Error, Result};

use super::Orchestrator;

/// A live change to an existing cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateRequest {
    /// Change node pool bounds
    Scale(NodeScaling),
    /// Upgrade the control plane to a Kubernetes version
    Version(String),
}

impl UpdateRequest {
    fn validate(&self, cluster: &str) -> Result<()> {
        match self {
            Self::Scale(s) => {
                NodeConfig::validate_scaling(cluster, s.min_size, s.max_size, s.desired_size)
            }
            Self::Version(v) if v.trim().is_empty() => Err(Error::configuration_for_field(
                cluster,
                "kubernetesVersion",
                "version must not be empty",
            )),
            Self::Version(_) => Ok(()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Scale(s) => format!(
                "scaling node pool to min={} max={} desired={}",
                s.min_size, s.max_size, s.desired_size
            ),
            Self::Version(v) => format!("upgrading to Kubernetes {}", v),
        }
    }

    /// Record the requested change in the stored config
    fn apply_to(&self, state: &mut ClusterState) {
        match self {
            Self::Scale(s) => {
                state.config.node.min_size = s.min_size;
                state.config.node.max_size = s.max_size;
                state.config.node.desired_size = s.desired_size;
            }
            Self::Version(v) => state.config.kubernetes_version = v.clone(),
        }
    }
}

impl Orchestrator {
    /// Change a cluster's node pool bounds
    ///
    /// Bounds are checked (`1 <= min <= desired <= max`) before the lock is
    /// taken.
    pub async fn scale_node_pool(
        &self,
        name: &str,
        min_size: u32,
        max_size: u32,
        desired_size: u32,
    ) -> Result<ClusterState> {
        self.update_cluster(
            name,
            UpdateRequest::Scale(NodeScaling::new(min_size, max_size, desired_size)),
        )
        .await
    }

    /// Upgrade a cluster's control plane version
    pub async fn upgrade_version(&self, name: &str, version: &str) -> Result<ClusterState> {
        self.update_cluster(name, UpdateRequest::Version(version.to_string()))
            .await
    }

    /// Apply an update under the cluster's lock
    ///
    /// The stored status moves to `Updating` before the provider is called,
    /// then to `Active` with the new config and resource graph. A provider
    /// failure, or a failure to record the applied change, leaves the status
    /// `Failed` with the error message and returns the error.
    #[instrument(skip(self), fields(cluster = %name))]
    pub async fn update_cluster(&self, name: &str, request: UpdateRequest) -> Result<ClusterState> {
        request.validate(name)?;

        self.locked(name, "update", |_| async move {
            let mut state = self.load(name).await?;
            let provider = self.providers.get(state.config.provider)?;

            let action = request.describe();
            state.status.transition(ClusterPhase::Updating, action.as_str());
            self.save(&state).await?;
            info!("{}", action);

            match invoke(provider, &state, &request).await {
                Ok(resources) => {
                    request.apply_to(&mut state);
                    state.set_provider_resources(resources);
                    state.status.ready = true;
                    state.status.transition(ClusterPhase::Active, "update complete");
                    if let Err(e) = self.save(&state).await {
                        error!(error = %e, "Update applied but not recorded");
                        state.status.ready = false;
                        state.status.transition(
                            ClusterPhase::Failed,
                            format!("update applied but not recorded: {}", e),
                        );
                        self.save_best_effort(&state).await;
                        return Err(e);
                    }
                    info!("Update complete");
                    Ok(state)
                }
                Err(e) => {
                    error!(error = %e, "Update failed");
                    state.status.ready = false;
                    state.status.transition(ClusterPhase::Failed, e.to_string());
                    self.save_best_effort(&state).await;
                    Err(e)
                }
            }
        })
        .await
    }
}

async fn invoke(
    provider: Arc<dyn Provider>,
    state: &ClusterState,
    request: &UpdateRequest,
) -> Result<serde_json::Value> {
    match request {
        UpdateRequest::Scale(scaling) => provider.scale_node_pool(state, *scaling).await,
        UpdateRequest::Version(version) => provider.upgrade_version(state, version).await,
    }
}
