//! The provider-agnostic state backend contract

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use strata_common::state::ClusterState;
use strata_common::Result;

use crate::lock::{LockHandle, LockInfo};

/// Directory (or key prefix) holding one sub-tree per cluster
pub const CLUSTERS_PREFIX: &str = "clusters/";
/// File name of a persisted cluster record
pub const STATE_FILE: &str = "state.json";

/// Backend metadata for diagnostics
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    /// Backend type ("s3", "local", ...)
    pub kind: String,
    /// Human-readable location (bucket/prefix or directory)
    pub location: String,
    /// Region, if the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Whether state is encrypted at rest
    pub encrypted: bool,
    /// Whether prior versions are retained
    pub versioned: bool,
    /// Whether writes are lock-protected
    pub locking: bool,
}

/// Durable, lock-protected storage for one [`ClusterState`] per cluster name
///
/// Backends never retry. Errors are classified so callers can apply
/// [`strata_common::retry::retry_if`] to the transient ones.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Create and configure the backing storage if needed (idempotent)
    async fn initialize(&self) -> Result<()>;

    /// Write the state under the cluster's key, replacing prior content
    async fn save(&self, name: &str, state: &ClusterState) -> Result<()>;

    /// Read the state; `NotFound` if absent
    async fn load(&self, name: &str) -> Result<ClusterState>;

    /// Remove the state; `NotFound` if absent
    async fn delete(&self, name: &str) -> Result<()>;

    /// Names of every stored cluster
    async fn list(&self) -> Result<Vec<String>>;

    /// Whether a state exists, without reading it
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Acquire the cluster's lock; `Conflict` if already held
    ///
    /// Never waits or retries.
    async fn lock(&self, name: &str, operation: &str) -> Result<LockHandle>;

    /// Release a lock held by `handle`
    ///
    /// A lock now held by a different owner is left in place and reported as
    /// `Conflict`. An already-released lock is not an error.
    async fn unlock(&self, handle: &LockHandle) -> Result<()>;

    /// Remove a lock regardless of owner (operator recovery)
    async fn force_unlock(&self, name: &str) -> Result<()>;

    /// Current holder of the cluster's lock, if any
    async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>>;

    /// Backend metadata
    fn info(&self) -> BackendInfo;
}

/// Relative key of a cluster's state under a backend prefix
pub fn state_key(prefix: &str, name: &str) -> String {
    format!("{}{}{}/{}", prefix, CLUSTERS_PREFIX, name, STATE_FILE)
}

/// Cluster name from a state key, if the key is one
pub fn name_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix(CLUSTERS_PREFIX)?
        .strip_suffix(STATE_FILE)?
        .strip_suffix('/')
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Reject names that would escape the cluster's key space
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(strata_common::Error::configuration_for_field(
            name,
            "name",
            "cluster name must be non-empty and must not contain '/' or '..'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "t1", "clusters/t1/state.json")]
    #[case("team-a/", "prod", "team-a/clusters/prod/state.json")]
    fn state_keys_are_deterministic(#[case] prefix: &str, #[case] name: &str, #[case] key: &str) {
        assert_eq!(state_key(prefix, name), key);
        assert_eq!(name_from_key(prefix, key), Some(name));
    }

    #[rstest]
    #[case("clusters/t1/other.json")]
    #[case("clusters/state.json")]
    #[case("clusters/a/b/state.json")]
    #[case("elsewhere/t1/state.json")]
    fn foreign_keys_are_not_cluster_names(#[case] key: &str) {
        assert_eq!(name_from_key("", key), None);
    }

    #[rstest]
    #[case("")]
    #[case("a/b")]
    #[case("..")]
    fn unsafe_names_are_rejected(#[case] name: &str) {
        assert!(check_name(name).is_err());
    }
}
