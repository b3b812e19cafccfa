//! Lock-guarded cluster workflows
//!
//! Every workflow that mutates a [`ClusterState`] takes the cluster's lock
//! first and releases it on every exit path. Lock acquisition never waits:
//! a held lock fails the workflow with `Conflict`. Backend reads and writes
//! are retried on transient errors; provider calls are not.
//!
//! Read-only queries (status, list, kubeconfig) take no lock and may observe a
//! stale snapshot.

mod create;
mod destroy;
mod query;
mod update;

pub use update::UpdateRequest;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use strata_common::config::Settings;
use strata_common::retry::retry_if;
use strata_common::state::ClusterState;
use strata_common::{Error, ErrorKind, Result};
use strata_state::{BackendInfo, LockHandle, LockInfo, StateBackend};

use crate::registry::ProviderRegistry;

/// Runs cluster workflows against one state backend
pub struct Orchestrator {
    settings: Settings,
    backend: Arc<dyn StateBackend>,
    providers: ProviderRegistry,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(settings: Settings, backend: Arc<dyn StateBackend>, providers: ProviderRegistry) -> Self {
        Self {
            settings,
            backend,
            providers,
        }
    }

    /// Runtime settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bootstrap the backing storage (idempotent)
    pub async fn initialize_backend(&self) -> Result<()> {
        self.backend.initialize().await
    }

    /// Backend metadata
    pub fn backend_info(&self) -> BackendInfo {
        self.backend.info()
    }

    /// Current holder of a cluster's lock
    pub async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>> {
        self.backend.lock_info(name).await
    }

    /// Remove a cluster's lock regardless of holder
    ///
    /// For recovering from a process that died while holding the lock.
    pub async fn force_unlock(&self, name: &str) -> Result<()> {
        warn!(cluster = %name, "Force-releasing lock");
        self.backend.force_unlock(name).await
    }

    /// Run `work` while holding the cluster's lock
    ///
    /// The lock is released whether `work` succeeds or fails; a failed release
    /// is logged and never replaces the result of `work`.
    async fn locked<T, F, Fut>(&self, name: &str, operation: &str, work: F) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.backend.lock(name, operation).await?;
        debug!(cluster = %name, operation = %operation, "Lock acquired");

        let result = work(handle.clone()).await;

        match self.backend.unlock(&handle).await {
            Ok(()) => debug!(cluster = %name, "Lock released"),
            Err(e) => warn!(
                cluster = %name,
                error = %e,
                "Failed to release lock; clear it with force-unlock once no operation is running"
            ),
        }
        result
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        retry_if(&self.settings.retry, "state_exists", Error::is_retryable, || {
            self.backend.exists(name)
        })
        .await
    }

    async fn load(&self, name: &str) -> Result<ClusterState> {
        retry_if(&self.settings.retry, "load_state", Error::is_retryable, || {
            self.backend.load(name)
        })
        .await
    }

    async fn save(&self, state: &ClusterState) -> Result<()> {
        retry_if(&self.settings.retry, "save_state", Error::is_retryable, || {
            self.backend.save(state.name(), state)
        })
        .await
    }

    /// Save, logging instead of failing; for status writes on an error path
    async fn save_best_effort(&self, state: &ClusterState) {
        if let Err(e) = self.save(state).await {
            warn!(cluster = %state.name(), error = %e, "Failed to record cluster status");
        }
    }

    /// Delete stored state; an already-absent record counts as deleted
    async fn delete_state(&self, name: &str) -> Result<()> {
        let result = retry_if(&self.settings.retry, "delete_state", Error::is_retryable, || {
            self.backend.delete(name)
        })
        .await;
        match result {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(cluster = %name, "State already absent");
                Ok(())
            }
            other => other,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockProvider;
    use super::*;
    use strata_common::cluster::CloudProvider;
    use strata_state::LocalBackend;

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("aws");
        Orchestrator::new(
            Settings::default(),
            Arc::new(LocalBackend::new(dir.path(), "ops@test")),
            ProviderRegistry::new().with(CloudProvider::Aws, Arc::new(provider)),
        )
    }

    #[tokio::test]
    async fn lock_is_released_when_work_fails() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);

        let result: Result<()> = orch
            .locked("t1", "create", |_| async { Err(Error::internal("test", "boom")) })
            .await;
        assert!(result.is_err());
        assert!(orch.lock_info("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn work_sees_its_own_lock() {
        let dir = tempfile::tempdir().unwrap();
        let orch = &orchestrator(&dir);

        let token = orch
            .locked("t1", "update", |handle| async move {
                let held = orch.lock_info("t1").await?.unwrap();
                assert_eq!(held.id, handle.owner_token());
                assert_eq!(held.operation, "update");
                Ok(held.id)
            })
            .await
            .unwrap();
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn deleting_absent_state_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.delete_state("never-created").await.unwrap();
    }

    #[tokio::test]
    async fn force_unlock_clears_a_stuck_lock() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let _stale = orch.backend.lock("t1", "create").await.unwrap();

        assert!(orch.lock_info("t1").await.unwrap().is_some());
        orch.force_unlock("t1").await.unwrap();
        assert!(orch.lock_info("t1").await.unwrap().is_none());
    }
}
