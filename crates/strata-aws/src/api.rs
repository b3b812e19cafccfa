//! AWS API seams
//!
//! The managers talk to AWS only through [`IamApi`], [`Ec2Api`] and [`EksApi`].
//! SDK adapters implement them against the real services; [`crate::sim`]
//! implements them in-process. Errors carry a typed [`CloudErrorKind`] so
//! callers never match on message text.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_common::lifecycle::ResourceState;
use strata_common::provider::NodeScaling;
use strata_common::Error;

/// Resource tags
pub type Tags = BTreeMap<String, String>;

// =============================================================================
// Errors
// =============================================================================

/// Structured classification of an AWS error code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudErrorKind {
    /// EntityAlreadyExists, ResourceInUseException on create, ...
    AlreadyExists,
    /// NoSuchEntity, InvalidVpcID.NotFound, ResourceNotFoundException, ...
    NotFound,
    /// Throttling, RequestLimitExceeded, 5xx
    Throttled,
    /// AccessDenied, UnauthorizedOperation
    AccessDenied,
    /// Service quota reached
    LimitExceeded,
    /// A dependent resource still references this one
    DependencyViolation,
    /// Request rejected as malformed
    InvalidParameter,
    /// Anything else
    Other,
}

impl CloudErrorKind {
    /// Classify an IAM, EC2 or EKS error code
    ///
    /// `ResourceInUseException` means different things on create and delete,
    /// hence the operation.
    pub fn from_code(operation: &str, code: &str) -> Self {
        match code {
            "EntityAlreadyExists" | "InvalidGroup.Duplicate" | "InvalidPermission.Duplicate"
            | "RouteAlreadyExists" | "Resource.AlreadyAssociated" => Self::AlreadyExists,
            "ResourceInUseException" if operation.starts_with("Create") => Self::AlreadyExists,
            "ResourceInUseException" | "DependencyViolation" | "DeleteConflict" => {
                Self::DependencyViolation
            }
            "NoSuchEntity" | "ResourceNotFoundException" | "NatGatewayNotFound" => Self::NotFound,
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded" | "InternalError"
            | "InternalFailure" | "ServiceFailure" | "ServiceUnavailable" | "Unavailable"
            | "ServerException" | "ServiceUnavailableException" => Self::Throttled,
            "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation"
            | "AuthFailure" => Self::AccessDenied,
            "InvalidParameter" | "InvalidParameterValue" | "InvalidParameterCombination"
            | "InvalidParameterException" | "InvalidRequestException" | "InvalidInput"
            | "MalformedPolicyDocument" | "ValidationError"
            | "UnsupportedAvailabilityZoneException" => Self::InvalidParameter,
            code if code.ends_with(".NotFound") => Self::NotFound,
            code if code.ends_with("LimitExceeded") || code.ends_with("LimitExceededException") => {
                Self::LimitExceeded
            }
            _ => Self::Other,
        }
    }
}

/// An error from an AWS API call
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{service}:{operation} failed ({kind:?}): {message}")]
pub struct CloudError {
    /// Error class
    pub kind: CloudErrorKind,
    /// Service ("iam", "ec2", "eks")
    pub service: String,
    /// API operation (e.g. "CreateRole")
    pub operation: String,
    /// Provider message
    pub message: String,
}

impl CloudError {
    /// Create a cloud error
    pub fn new(
        kind: CloudErrorKind,
        service: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            service: service.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error is of the given kind
    pub fn is(&self, kind: CloudErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<CloudError> for Error {
    fn from(e: CloudError) -> Self {
        let provider = format!("aws/{}", e.service);
        match e.kind {
            CloudErrorKind::NotFound => Error::not_found(e.operation, e.message),
            CloudErrorKind::Throttled => {
                Error::provider_transient(provider, e.operation, e.message)
            }
            kind => Error::provider_fatal(
                provider,
                e.operation,
                format!("{:?}: {}", kind, e.message),
            ),
        }
    }
}

/// Result type for AWS API calls
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Outcome of a create-or-reuse call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ensured<T> {
    /// The resource was created by this call
    Created(T),
    /// The resource already existed and was fetched instead
    AlreadyExisted(T),
}

impl<T> Ensured<T> {
    /// The resource, however it was obtained
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(v) | Self::AlreadyExisted(v) => v,
        }
    }

    /// Whether this call created the resource
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Turn an `AlreadyExists` create failure into a fetch of the existing resource
pub async fn ensure<T, F, Fut>(created: CloudResult<T>, fetch_existing: F) -> CloudResult<Ensured<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = CloudResult<T>>,
{
    match created {
        Ok(value) => Ok(Ensured::Created(value)),
        Err(e) if e.is(CloudErrorKind::AlreadyExists) => {
            fetch_existing().await.map(Ensured::AlreadyExisted)
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// IAM
// =============================================================================

/// An IAM role
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Role ARN
    pub arn: String,
}

/// An IAM instance profile
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProfile {
    /// Profile name
    pub name: String,
    /// Profile ARN
    pub arn: String,
    /// Names of attached roles
    pub roles: Vec<String>,
}

/// IAM operations used by the identity manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamApi: Send + Sync {
    /// CreateRole
    async fn create_role(&self, name: &str, trust_policy: &str, tags: &Tags) -> CloudResult<Role>;
    /// GetRole
    async fn get_role(&self, name: &str) -> CloudResult<Role>;
    /// AttachRolePolicy (idempotent)
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()>;
    /// ListAttachedRolePolicies
    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<String>>;
    /// DetachRolePolicy
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()>;
    /// DeleteRole
    async fn delete_role(&self, name: &str) -> CloudResult<()>;
    /// CreateInstanceProfile
    async fn create_instance_profile(&self, name: &str, tags: &Tags) -> CloudResult<InstanceProfile>;
    /// GetInstanceProfile
    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile>;
    /// AddRoleToInstanceProfile
    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()>;
    /// RemoveRoleFromInstanceProfile
    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str)
        -> CloudResult<()>;
    /// DeleteInstanceProfile
    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()>;
}

// =============================================================================
// EC2
// =============================================================================

/// Target of a route
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteTarget {
    /// Internet gateway id
    InternetGateway(String),
    /// NAT gateway id
    NatGateway(String),
}

/// Peer of a security group rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RulePeer {
    /// Another (or the same) security group
    SecurityGroup(String),
    /// An IPv4 range
    Cidr(String),
}

/// One security group rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    /// "tcp", "udp" or "-1" for all
    pub protocol: String,
    /// First port (ignored for "-1")
    pub from_port: u16,
    /// Last port (ignored for "-1")
    pub to_port: u16,
    /// Source (ingress) or destination (egress)
    pub peer: RulePeer,
    /// Rule description
    pub description: String,
}

impl SecurityRule {
    /// TCP port range to or from a security group
    pub fn tcp(from_port: u16, to_port: u16, group_id: &str, description: &str) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port,
            to_port,
            peer: RulePeer::SecurityGroup(group_id.to_string()),
            description: description.to_string(),
        }
    }

    /// All traffic to or from a security group
    pub fn all(group_id: &str, description: &str) -> Self {
        Self {
            protocol: "-1".to_string(),
            from_port: 0,
            to_port: 0,
            peer: RulePeer::SecurityGroup(group_id.to_string()),
            description: description.to_string(),
        }
    }
}

/// EC2 operations used by the network manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// DescribeAvailabilityZones (available zones, sorted)
    async fn describe_availability_zones(&self) -> CloudResult<Vec<String>>;
    /// CreateVpc, returning the VPC id
    async fn create_vpc(&self, cidr: &str, tags: &Tags) -> CloudResult<String>;
    /// DescribeVpcs for one VPC
    async fn describe_vpc_state(&self, vpc_id: &str) -> CloudResult<ResourceState>;
    /// ModifyVpcAttribute for DNS support and DNS hostnames
    async fn enable_vpc_dns(&self, vpc_id: &str) -> CloudResult<()>;
    /// DeleteVpc
    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()>;

    /// CreateInternetGateway
    async fn create_internet_gateway(&self, tags: &Tags) -> CloudResult<String>;
    /// AttachInternetGateway
    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()>;
    /// DetachInternetGateway
    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()>;
    /// DeleteInternetGateway
    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()>;

    /// CreateSubnet
    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
        tags: &Tags,
    ) -> CloudResult<String>;
    /// ModifySubnetAttribute MapPublicIpOnLaunch
    async fn enable_public_ip_on_launch(&self, subnet_id: &str) -> CloudResult<()>;
    /// DeleteSubnet
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;

    /// AllocateAddress (VPC domain), returning the allocation id
    async fn allocate_address(&self, tags: &Tags) -> CloudResult<String>;
    /// ReleaseAddress
    async fn release_address(&self, allocation_id: &str) -> CloudResult<()>;
    /// CreateNatGateway
    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        tags: &Tags,
    ) -> CloudResult<String>;
    /// DescribeNatGateways for one gateway
    async fn describe_nat_gateway_state(&self, nat_id: &str) -> CloudResult<ResourceState>;
    /// DeleteNatGateway
    async fn delete_nat_gateway(&self, nat_id: &str) -> CloudResult<()>;

    /// CreateRouteTable
    async fn create_route_table(&self, vpc_id: &str, tags: &Tags) -> CloudResult<String>;
    /// CreateRoute
    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> CloudResult<()>;
    /// AssociateRouteTable, returning the association id
    async fn associate_route_table(&self, route_table_id: &str, subnet_id: &str)
        -> CloudResult<String>;
    /// DisassociateRouteTable
    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()>;
    /// DeleteRouteTable
    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()>;

    /// CreateSecurityGroup
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> CloudResult<String>;
    /// AuthorizeSecurityGroupIngress
    async fn authorize_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()>;
    /// AuthorizeSecurityGroupEgress
    async fn authorize_egress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()>;
    /// RevokeSecurityGroupIngress; `NotFound` if a rule is not present
    async fn revoke_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()>;
    /// RevokeSecurityGroupEgress; `NotFound` if a rule is not present
    async fn revoke_egress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()>;
    /// DeleteSecurityGroup
    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()>;
}

// =============================================================================
// EKS
// =============================================================================

/// CreateCluster request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneRequest {
    /// Cluster name
    pub name: String,
    /// Kubernetes version
    pub version: String,
    /// Cluster role ARN
    pub role_arn: String,
    /// Subnets for control plane ENIs
    pub subnet_ids: Vec<String>,
    /// Additional security groups
    pub security_group_ids: Vec<String>,
    /// Control plane log types to enable
    pub log_types: Vec<String>,
    /// Tags
    pub tags: Tags,
}

/// DescribeCluster response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneDescription {
    /// Cluster name
    pub name: String,
    /// Cluster ARN
    pub arn: String,
    /// Kubernetes version
    pub version: String,
    /// API server endpoint, once provisioned
    pub endpoint: Option<String>,
    /// Base64 CA bundle, once provisioned
    pub certificate_authority_data: Option<String>,
    /// Lifecycle state
    pub status: ResourceState,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// CreateNodegroup request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeGroupRequest {
    /// Owning cluster
    pub cluster: String,
    /// Node group name
    pub name: String,
    /// Node role ARN
    pub node_role_arn: String,
    /// Subnets nodes launch into
    pub subnet_ids: Vec<String>,
    /// Instance types
    pub instance_types: Vec<String>,
    /// Root volume size
    pub disk_size_gb: u32,
    /// Scaling bounds
    pub scaling: NodeScaling,
    /// Kubernetes node labels
    pub labels: BTreeMap<String, String>,
    /// Tags
    pub tags: Tags,
}

/// DescribeNodegroup response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeGroupDescription {
    /// Node group name
    pub name: String,
    /// Node group ARN
    pub arn: String,
    /// Lifecycle state
    pub status: ResourceState,
    /// Instance types
    pub instance_types: Vec<String>,
    /// Scaling bounds
    pub scaling: NodeScaling,
    /// Kubernetes version of the nodes
    pub version: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Status of a long-running EKS update
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Still running
    InProgress,
    /// Finished successfully
    Successful,
    /// Finished with an error
    Failed(String),
    /// Cancelled by the service
    Cancelled,
}

/// EKS operations used by the cluster manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EksApi: Send + Sync {
    /// CreateCluster
    async fn create_cluster(&self, request: &ControlPlaneRequest)
        -> CloudResult<ControlPlaneDescription>;
    /// DescribeCluster
    async fn describe_cluster(&self, name: &str) -> CloudResult<ControlPlaneDescription>;
    /// DeleteCluster
    async fn delete_cluster(&self, name: &str) -> CloudResult<()>;
    /// UpdateClusterVersion, returning the update id
    async fn update_cluster_version(&self, name: &str, version: &str) -> CloudResult<String>;

    /// CreateNodegroup
    async fn create_nodegroup(&self, request: &NodeGroupRequest)
        -> CloudResult<NodeGroupDescription>;
    /// DescribeNodegroup
    async fn describe_nodegroup(&self, cluster: &str, name: &str)
        -> CloudResult<NodeGroupDescription>;
    /// UpdateNodegroupConfig, returning the update id
    async fn update_nodegroup_config(
        &self,
        cluster: &str,
        name: &str,
        scaling: NodeScaling,
    ) -> CloudResult<String>;
    /// DeleteNodegroup
    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()>;

    /// DescribeUpdate
    async fn describe_update(
        &self,
        cluster: &str,
        nodegroup: Option<String>,
        update_id: &str,
    ) -> CloudResult<UpdateStatus>;

    /// CreateAddon
    async fn create_addon(&self, cluster: &str, addon: &str) -> CloudResult<()>;
    /// DescribeAddon
    async fn describe_addon(&self, cluster: &str, addon: &str) -> CloudResult<ResourceState>;
}
