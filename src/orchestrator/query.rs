//! Read-only queries

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use strata_common::kubeconfig::{merge_into_file, write_kubeconfig};
use strata_common::retry::retry_if;
use strata_common::state::ClusterState;
use strata_common::{Error, Result};

use super::Orchestrator;

impl Orchestrator {
    /// Stored state of a cluster
    ///
    /// With `refresh`, the status is replaced by what the provider reports
    /// live. The refreshed status is returned but never written back.
    #[instrument(skip(self))]
    pub async fn status(&self, name: &str, refresh: bool) -> Result<ClusterState> {
        let mut state = self.load(name).await?;
        if refresh {
            let provider = self.providers.get(state.config.provider)?;
            state.status = provider.refresh_status(&state).await?;
            debug!(phase = %state.status.phase, "Refreshed live status");
        }
        Ok(state)
    }

    /// Names of every stored cluster, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = retry_if(&self.settings.retry, "list_state", Error::is_retryable, || {
            self.backend.list()
        })
        .await?;
        names.sort();
        Ok(names)
    }

    /// Write the cluster's kubeconfig to `{kubeconfig_dir}/{name}.yaml`
    ///
    /// With `merge_into`, the entries are also upserted into that file and its
    /// current context switched to this cluster.
    #[instrument(skip(self, merge_into))]
    pub async fn export_kubeconfig(&self, name: &str, merge_into: Option<&Path>) -> Result<PathBuf> {
        let state = self.load(name).await?;
        let provider = self.providers.get(state.config.provider)?;
        let kubeconfig = provider.kubeconfig(&state).await?;

        let path = self.settings.kubeconfig_dir.join(format!("{}.yaml", name));
        write_kubeconfig(&path, &kubeconfig)?;
        info!(path = %path.display(), "Kubeconfig written");

        if let Some(primary) = merge_into {
            merge_into_file(primary, kubeconfig)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::MockProvider;
    use super::*;
    use crate::registry::ProviderRegistry;
    use strata_common::cluster::{CloudProvider, ClusterConfig};
    use strata_common::config::Settings;
    use strata_common::kubeconfig::{ExecPlugin, Kubeconfig, KubeconfigSpec};
    use strata_common::state::{ClusterPhase, ClusterStatus};
    use strata_common::ErrorKind;
    use strata_state::{LocalBackend, StateBackend};

    fn setup(
        provider: MockProvider,
        dir: &tempfile::TempDir,
    ) -> (Orchestrator, Arc<LocalBackend>) {
        let backend = Arc::new(LocalBackend::new(dir.path().join("state"), "ops@test"));
        let orch = Orchestrator::new(
            Settings::default().with_kubeconfig_dir(dir.path().join("kubeconfigs")),
            backend.clone(),
            ProviderRegistry::new().with(CloudProvider::Aws, Arc::new(provider)),
        );
        (orch, backend)
    }

    async fn stored(backend: &LocalBackend, name: &str) -> ClusterState {
        let state = ClusterState::new(
            ClusterConfig::new(name, "us-east-1"),
            ClusterStatus::new(ClusterPhase::Active, "cluster ready"),
        );
        backend.save(name, &state).await.unwrap();
        state
    }

    fn kubeconfig_for(name: &str) -> Kubeconfig {
        Kubeconfig::generate(&KubeconfigSpec {
            entry_name: format!("arn:aws:eks:us-east-1:123456789012:cluster/{}", name),
            server: format!("https://{}.eks.example.com", name),
            certificate_authority_data: "Y2VydA==".to_string(),
            exec: ExecPlugin {
                api_version: "client.authentication.k8s.io/v1beta1".to_string(),
                command: "aws".to_string(),
                args: vec!["eks".to_string(), "get-token".to_string()],
                env: Vec::new(),
                interactive_mode: "IfAvailable".to_string(),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn status_without_refresh_skips_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider.expect_refresh_status().never();
        let (orch, backend) = setup(provider, &dir);
        let saved = stored(&backend, "t1").await;

        assert_eq!(orch.status("t1", false).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn refreshed_status_is_not_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider.expect_refresh_status().times(1).returning(|_| {
            let mut status = ClusterStatus::new(ClusterPhase::Updating, "node group UPDATING");
            status.nodes_total = 3;
            Ok(status)
        });
        let (orch, backend) = setup(provider, &dir);
        stored(&backend, "t1").await;

        let state = orch.status("t1", true).await.unwrap();
        assert_eq!(state.status.phase, ClusterPhase::Updating);
        assert_eq!(state.status.nodes_total, 3);
        assert_eq!(backend.load("t1").await.unwrap().status.phase, ClusterPhase::Active);
    }

    #[tokio::test]
    async fn status_of_unknown_cluster_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(MockProvider::new(), &dir);
        let err = orch.status("ghost", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, backend) = setup(MockProvider::new(), &dir);
        for name in ["zeta", "alpha", "mid"] {
            stored(&backend, name).await;
        }
        assert_eq!(orch.list().await.unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn kubeconfig_is_written_per_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider
            .expect_kubeconfig()
            .returning(|state| Ok(kubeconfig_for(state.name())));
        let (orch, backend) = setup(provider, &dir);
        stored(&backend, "t1").await;

        let path = orch.export_kubeconfig("t1", None).await.unwrap();
        assert_eq!(path, dir.path().join("kubeconfigs").join("t1.yaml"));

        let written = Kubeconfig::from_yaml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, kubeconfig_for("t1"));
    }

    #[tokio::test]
    async fn kubeconfig_merge_keeps_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = MockProvider::new();
        provider
            .expect_kubeconfig()
            .returning(|state| Ok(kubeconfig_for(state.name())));
        let (orch, backend) = setup(provider, &dir);
        stored(&backend, "t1").await;

        let primary = dir.path().join("config");
        write_kubeconfig(&primary, &kubeconfig_for("other")).unwrap();

        orch.export_kubeconfig("t1", Some(&primary)).await.unwrap();

        let merged = Kubeconfig::from_yaml(&std::fs::read_to_string(&primary).unwrap()).unwrap();
        assert_eq!(merged.clusters.len(), 2);
        assert_eq!(
            merged.current_context.as_deref(),
            Some("arn:aws:eks:us-east-1:123456789012:cluster/t1")
        );
        assert_eq!(
            merged.server("arn:aws:eks:us-east-1:123456789012:cluster/other"),
            Some("https://other.eks.example.com")
        );
    }
}
