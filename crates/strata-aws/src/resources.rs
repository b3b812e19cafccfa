//! AWS resource graph
//!
//! Every field is optional or a list so that a graph captured midway through
//! a failed create still serializes and can be handed to teardown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_common::lifecycle::ResourceState;
use strata_common::provider::NodeScaling;
use strata_common::{Error, Result};

use crate::api::Role;

/// Full resource graph of one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsResources {
    /// Network graph
    #[serde(default)]
    pub networking: NetworkingResources,
    /// Roles and instance profile
    #[serde(default)]
    pub iam: IamResources,
    /// Control plane and node groups
    #[serde(default)]
    pub cluster: ClusterResources,
}

impl AwsResources {
    /// Encode for persistence
    pub fn to_value(&self) -> serde_json::Value {
        // Plain data with string keys; encoding cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode a persisted graph
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::serialization(format!("aws resource graph: {}", e)))
    }
}

// =============================================================================
// Networking
// =============================================================================

/// A subnet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    /// Subnet id
    pub id: String,
    /// Subnet CIDR
    pub cidr: String,
    /// Availability zone
    pub availability_zone: String,
    /// Whether instances get public addresses and route via the internet gateway
    pub public: bool,
}

/// A NAT gateway and its static address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatGateway {
    /// NAT gateway id
    pub id: String,
    /// Elastic IP allocation id
    pub allocation_id: String,
    /// Public subnet hosting the gateway
    pub subnet_id: String,
    /// Availability zone
    pub availability_zone: String,
}

/// A route table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    /// Route table id
    pub id: String,
    /// Whether this is the shared public table
    pub public: bool,
    /// Associated subnets
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Association ids, parallel to `subnet_ids`
    #[serde(default)]
    pub association_ids: Vec<String>,
}

/// What a security group protects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityGroupRole {
    /// Control plane ENIs
    ControlPlane,
    /// Worker nodes
    Nodes,
}

/// A security group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    /// Group id
    pub id: String,
    /// Group name
    pub name: String,
    /// Group description
    pub description: String,
    /// What the group protects
    pub role: SecurityGroupRole,
}

/// Network graph
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingResources {
    /// VPC id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    /// VPC CIDR
    #[serde(default)]
    pub vpc_cidr: String,
    /// Public subnets, one per AZ
    #[serde(default)]
    pub public_subnets: Vec<Subnet>,
    /// Private subnets, one per AZ
    #[serde(default)]
    pub private_subnets: Vec<Subnet>,
    /// Internet gateway id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_gateway_id: Option<String>,
    /// Whether the internet gateway was attached to the VPC
    #[serde(default)]
    pub internet_gateway_attached: bool,
    /// NAT gateways, one per AZ
    #[serde(default)]
    pub nat_gateways: Vec<NatGateway>,
    /// Addresses allocated but not bound to a recorded NAT gateway
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unbound_allocation_ids: Vec<String>,
    /// Route tables
    #[serde(default)]
    pub route_tables: Vec<RouteTable>,
    /// Security groups
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
}

impl NetworkingResources {
    /// Security group with the given role
    pub fn security_group(&self, role: SecurityGroupRole) -> Option<&SecurityGroup> {
        self.security_groups.iter().find(|sg| sg.role == role)
    }

    /// Private then public subnet ids
    pub fn all_subnet_ids(&self) -> Vec<String> {
        self.private_subnets
            .iter()
            .chain(&self.public_subnets)
            .map(|s| s.id.clone())
            .collect()
    }
}

// =============================================================================
// IAM
// =============================================================================

/// Roles and instance profile
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamResources {
    /// Control plane role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_role: Option<Role>,
    /// Worker node role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_role: Option<Role>,
    /// Node instance profile name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_instance_profile_name: Option<String>,
    /// Node instance profile ARN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_instance_profile_arn: Option<String>,
}

// =============================================================================
// Cluster
// =============================================================================

/// Managed control plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlane {
    /// Cluster name
    pub name: String,
    /// Cluster ARN
    pub arn: String,
    /// Kubernetes version
    pub version: String,
    /// API server endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Base64 CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Last observed state
    pub status: ResourceState,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Managed node group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// Node group name
    pub name: String,
    /// Node group ARN
    pub arn: String,
    /// Last observed state
    pub status: ResourceState,
    /// Instance types
    pub instance_types: Vec<String>,
    /// Scaling bounds
    pub scaling: NodeScaling,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Control plane and node groups
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResources {
    /// Control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlane>,
    /// Node groups
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
    /// Installed managed add-ons
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<String>,
}
