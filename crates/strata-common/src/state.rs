//! Observed cluster state, as persisted by the state backend

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::{Error, Result};

/// Lifecycle phase of a cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// Resources are being created
    #[default]
    Creating,
    /// Cluster is usable
    Active,
    /// An in-place update is running
    Updating,
    /// Teardown is running
    Deleting,
    /// The last operation failed
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Active => write!(f, "Active"),
            Self::Updating => write!(f, "Updating"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed status of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current phase
    pub phase: ClusterPhase,
    /// Whether the control plane and nodes are ready
    pub ready: bool,
    /// Human-readable detail
    #[serde(default)]
    pub message: String,
    /// Control plane API endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Nodes reporting ready
    #[serde(default)]
    pub nodes_ready: u32,
    /// Nodes requested
    #[serde(default)]
    pub nodes_total: u32,
    /// Time of the last status change
    pub last_updated: DateTime<Utc>,
}

impl ClusterStatus {
    /// Status in the given phase, stamped now
    pub fn new(phase: ClusterPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            ready: false,
            message: message.into(),
            endpoint: None,
            nodes_ready: 0,
            nodes_total: 0,
            last_updated: Utc::now(),
        }
    }

    /// Move to a new phase, refreshing the timestamp
    pub fn transition(&mut self, phase: ClusterPhase, message: impl Into<String>) {
        self.phase = phase;
        self.message = message.into();
        self.ready = phase == ClusterPhase::Active && self.ready;
        self.last_updated = Utc::now();
    }
}

/// Persisted record of one cluster
///
/// `resources` is the provider resource graph keyed by provider name
/// (`"aws"` -> serialized AWS resources). The state backend treats it as
/// opaque JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Configuration that produced this state
    pub config: ClusterConfig,
    /// Observed status
    pub status: ClusterStatus,
    /// Provider resource graphs
    #[serde(default)]
    pub resources: BTreeMap<String, serde_json::Value>,
}

impl ClusterState {
    /// Create a state record
    pub fn new(config: ClusterConfig, status: ClusterStatus) -> Self {
        Self {
            config,
            status,
            resources: BTreeMap::new(),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Resource graph recorded for the config's provider
    pub fn provider_resources(&self) -> Result<&serde_json::Value> {
        let key = self.config.provider.as_str();
        self.resources
            .get(key)
            .ok_or_else(|| Error::not_found("resource graph", format!("{}/{}", self.name(), key)))
    }

    /// Replace the resource graph for the config's provider
    pub fn set_provider_resources(&mut self, resources: serde_json::Value) {
        self.resources
            .insert(self.config.provider.as_str().to_string(), resources);
    }

    /// Canonical encoding written by state backends
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode a persisted record
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterState {
        let mut status = ClusterStatus::new(ClusterPhase::Active, "cluster ready");
        status.ready = true;
        status.endpoint = Some("https://ABC.gr7.us-east-1.eks.amazonaws.com".into());
        status.nodes_ready = 2;
        status.nodes_total = 2;

        let mut state = ClusterState::new(ClusterConfig::new("t1", "us-east-1"), status);
        state.set_provider_resources(serde_json::json!({
            "networking": {"vpcId": "vpc-1", "publicSubnets": [{"id": "subnet-1"}]},
            "iam": {"clusterRole": {"name": "t1-cluster-role"}}
        }));
        state
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let state = sample();
        let bytes = state.to_json().unwrap();
        let back = ClusterState::from_json(&bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn provider_resources_are_keyed_by_provider() {
        let state = sample();
        let graph = state.provider_resources().unwrap();
        assert_eq!(graph["networking"]["vpcId"], "vpc-1");
        assert!(state.resources.contains_key("aws"));
    }

    #[test]
    fn missing_graph_is_not_found() {
        let state = ClusterState::new(
            ClusterConfig::new("t1", "us-east-1"),
            ClusterStatus::new(ClusterPhase::Creating, ""),
        );
        let err = state.provider_resources().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn transition_clears_ready_outside_active() {
        let mut status = ClusterStatus::new(ClusterPhase::Active, "ok");
        status.ready = true;
        status.transition(ClusterPhase::Updating, "scaling node group");
        assert!(!status.ready);
        assert_eq!(status.phase, ClusterPhase::Updating);
    }
}
