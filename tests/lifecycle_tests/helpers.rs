//! Shared fixtures: one simulated AWS account and one in-memory state store,
//! reachable by any number of operators

use std::sync::Arc;

use strata::{Orchestrator, ProviderRegistry};
use strata_aws::{AwsClients, SimulatedCloud};
use strata_common::cluster::ClusterConfig;
use strata_common::config::{Settings, Timeouts};
use strata_state::{resolve_backend, BackendClients, MemoryLockTable, MemoryObjectStore, StateBackend};
use tempfile::TempDir;

pub const STATE_URL: &str = "s3://strata-state/clusters?lock_table=strata-locks";

/// The cluster every story starts from: two zones, 1..3 nodes wanting 2
pub const SMALL_CLUSTER: &str = r#"
name: t1
region: us-east-1
network:
  azCount: 2
node:
  minSize: 1
  maxSize: 3
  desiredSize: 2
"#;

pub fn small_cluster() -> ClusterConfig {
    ClusterConfig::from_yaml_str(SMALL_CLUSTER).unwrap()
}

pub const ALICE: &str = "alice@host";
pub const BOB: &str = "bob@host";

pub struct Harness {
    pub cloud: Arc<SimulatedCloud>,
    pub objects: Arc<MemoryObjectStore>,
    pub locks: Arc<MemoryLockTable>,
    pub dir: TempDir,
}

impl Harness {
    /// Fresh account with an initialized state backend
    pub async fn new() -> Self {
        let harness = Self {
            cloud: Arc::new(SimulatedCloud::new()),
            objects: Arc::new(MemoryObjectStore::new()),
            locks: Arc::new(MemoryLockTable::new()),
            dir: tempfile::tempdir().unwrap(),
        };
        harness.alice().initialize_backend().await.unwrap();
        harness
    }

    /// The operator most stories are told from
    pub fn alice(&self) -> Orchestrator {
        self.operator(ALICE)
    }

    pub fn settings(&self, owner: &str) -> Settings {
        Settings::default()
            .with_backend_url(STATE_URL)
            .with_region("us-east-1")
            .with_owner(owner)
            .with_kubeconfig_dir(self.dir.path().join("kubeconfigs"))
            .with_timeouts(Timeouts::immediate())
    }

    /// A state backend bound to `owner`, sharing this harness's stores
    pub fn backend(&self, owner: &str) -> Arc<dyn StateBackend> {
        let clients = BackendClients {
            object_store: self.objects.clone(),
            lock_table: self.locks.clone(),
        };
        resolve_backend(&self.settings(owner), Some(&clients)).unwrap()
    }

    /// Another operator working against the same account and state
    pub fn operator(&self, owner: &str) -> Orchestrator {
        let settings = self.settings(owner);
        let providers =
            ProviderRegistry::aws(AwsClients::from_shared(self.cloud.clone()), &settings);
        Orchestrator::new(settings, self.backend(owner), providers)
    }
}
