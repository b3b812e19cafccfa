//! Cluster creation

use tracing::{error, info, instrument};

use strata_common::cluster::ClusterConfig;
use strata_common::state::ClusterState;
use strata_common::{Error, Result};

use super::Orchestrator;

impl Orchestrator {
    /// Create every resource for `config` and persist the resulting state
    ///
    /// Fails with `Configuration` before touching anything if the config is
    /// invalid, and with `Conflict` if the name is locked or already has state.
    /// A provider failure is returned as `CreateFailed` carrying the partial
    /// resource graph; nothing is rolled back and no state is saved. Pass the
    /// graph to [`Orchestrator::destroy_partial`] to reclaim it.
    #[instrument(skip_all, fields(cluster = %config.name))]
    pub async fn create_cluster(&self, config: &ClusterConfig) -> Result<ClusterState> {
        config.validate()?;
        let provider = self.providers.get(config.provider)?;
        let name = config.name.as_str();

        self.locked(name, "create", |_| async move {
            if self.exists(name).await? {
                return Err(Error::conflict(name, "cluster already exists"));
            }

            info!(provider = provider.name(), region = %config.region, "Creating cluster");
            let provisioned = provider.create(config).await.map_err(|e| {
                error!(error = %e, "Cluster creation failed; run destroy to reclaim partial resources");
                e
            })?;

            let mut state = ClusterState::new(config.clone(), provisioned.status);
            state.set_provider_resources(provisioned.resources);

            if let Err(e) = self.save(&state).await {
                error!(error = %e, "Cluster created but its state could not be saved");
                let graph = state.provider_resources().cloned().unwrap_or_default();
                return Err(Error::create_failed(name, "state", e, graph));
            }

            info!(
                endpoint = ?state.status.endpoint,
                nodes = state.status.nodes_total,
                "Cluster active"
            );
            Ok(state)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::MockProvider;
    use super::*;
    use crate::registry::ProviderRegistry;
    use strata_common::cluster::CloudProvider;
    use strata_common::config::Settings;
    use strata_common::provider::ProvisionedCluster;
    use strata_common::state::{ClusterPhase, ClusterStatus};
    use strata_common::ErrorKind;
    use strata_state::{LocalBackend, StateBackend};

    fn active() -> ProvisionedCluster {
        let mut status = ClusterStatus::new(ClusterPhase::Active, "cluster ready");
        status.ready = true;
        status.nodes_total = 2;
        ProvisionedCluster {
            resources: serde_json::json!({ "networking": { "vpcId": "vpc-1" } }),
            status,
        }
    }

    fn setup(provider: MockProvider, dir: &tempfile::TempDir) -> (Orchestrator, Arc<LocalBackend>) {
        let backend = Arc::new(LocalBackend::new(dir.path(), "ops@test"));
        let orch = Orchestrator::new(
            Settings::default(),
            backend.clone(),
            ProviderRegistry::new().with(CloudProvider::Aws, Arc::new(provider)),
        );
        (orch, backend)
    }

    fn provider_creating_once() -> MockProvider {
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("aws");
        provider.expect_create().times(1).returning(|_| Ok(active()));
        provider
    }

    #[tokio::test]
    async fn successful_create_persists_active_state() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, backend) = setup(provider_creating_once(), &dir);

        let state = orch
            .create_cluster(&ClusterConfig::new("t1", "us-east-1"))
            .await
            .unwrap();

        assert_eq!(state.status.phase, ClusterPhase::Active);
        assert_eq!(backend.load("t1").await.unwrap(), state);
        assert_eq!(state.resources["aws"]["networking"]["vpcId"], "vpc-1");
        assert!(backend.lock_info("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_name_is_refused_without_provider_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(provider_creating_once(), &dir);
        let config = ClusterConfig::new("t1", "us-east-1");
        orch.create_cluster(&config).await.unwrap();

        // The mock allows exactly one create; a second provider call would panic.
        let err = orch.create_cluster(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(orch.lock_info("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn held_lock_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider.expect_create().never();
        let (orch, backend) = setup(provider, &dir);
        let _held = backend.lock("t1", "destroy").await.unwrap();

        let err = orch
            .create_cluster(&ClusterConfig::new("t1", "us-east-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!backend.exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_config_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider.expect_create().never();
        let (orch, backend) = setup(provider, &dir);

        let mut config = ClusterConfig::new("t1", "us-east-1");
        config.node.min_size = 3;
        config.node.desired_size = 2;

        let err = orch.create_cluster(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(backend.lock_info("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_failure_saves_nothing_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("aws");
        provider.expect_create().returning(|config| {
            Err(Error::create_failed(
                &config.name,
                "network",
                Error::provider_fatal("aws/ec2", "CreateNatGateway", "quota"),
                serde_json::json!({ "iam": { "clusterRole": { "name": "r", "arn": "a" } } }),
            ))
        });
        let (orch, backend) = setup(provider, &dir);

        let err = orch
            .create_cluster(&ClusterConfig::new("t1", "us-east-1"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
        assert!(err.partial_resources().is_some());
        assert!(err.to_string().contains("run destroy"));
        assert!(!backend.exists("t1").await.unwrap());
        assert!(backend.lock_info("t1").await.unwrap().is_none());
    }
}
