//! Resource lifecycle states
//!
//! Control planes, node groups, virtual networks and NAT gateways all move
//! through the same shape:
//!
//! ```text
//! Requested -> Provisioning -> Active -> Deleting -> Absent
//!                   |                        |
//!                   +--------> Failed <------+
//! ```

use serde::{Deserialize, Serialize};

/// Observed state of a single provider resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ResourceState {
    /// Create call accepted, nothing observed yet
    Requested,
    /// Provider is still building the resource
    Provisioning,
    /// Resource is usable
    Active,
    /// Provider is tearing the resource down
    Deleting,
    /// Resource no longer exists
    Absent,
    /// Provider reported an error
    Failed(String),
}

impl ResourceState {
    /// Whether the resource has reached a state it will not leave on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Absent | Self::Failed(_))
    }

    /// Whether the resource still exists in any form
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "Requested"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Active => write!(f, "Active"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Absent => write!(f, "Absent"),
            Self::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ResourceState::Active.is_terminal());
        assert!(ResourceState::Absent.is_terminal());
        assert!(ResourceState::Failed("boom".into()).is_terminal());
        assert!(!ResourceState::Provisioning.is_terminal());
        assert!(!ResourceState::Deleting.is_terminal());
    }

    #[test]
    fn only_absent_does_not_exist() {
        assert!(!ResourceState::Absent.exists());
        assert!(ResourceState::Deleting.exists());
        assert!(ResourceState::Requested.exists());
    }

    #[test]
    fn failed_state_serializes_reason() {
        let json = serde_json::to_value(ResourceState::Failed("quota".into())).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "reason": "quota"}));
        let back: ResourceState = serde_json::from_value(json).unwrap();
        assert_eq!(back, ResourceState::Failed("quota".into()));
    }
}
