//! IAM, EC2 and EKS clients behind the API seams
//!
//! Only built with the `sdk` feature. Error codes are classified with
//! [`CloudErrorKind::from_code`]; transport failures and timeouts count as
//! throttling so callers treat them as transient.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    AttributeBooleanValue, DomainType, Filter, IpPermission, IpRange, NatGatewayState,
    ResourceType, TagSpecification, UserIdGroupPair, VpcState,
};
use aws_sdk_eks::types::{
    AddonStatus, ClusterStatus, LogSetup, LogType, Logging, Nodegroup, NodegroupScalingConfig,
    NodegroupStatus, UpdateStatus as EksUpdateStatus, VpcConfigRequest,
};
use chrono::{DateTime, Utc};
use tracing::debug;

use strata_common::lifecycle::ResourceState;
use strata_common::provider::NodeScaling;

use crate::api::{
    CloudError, CloudErrorKind, CloudResult, ControlPlaneDescription, ControlPlaneRequest, Ec2Api,
    EksApi, IamApi, InstanceProfile, NodeGroupDescription, NodeGroupRequest, Role, RouteTarget,
    RulePeer, SecurityRule, Tags, UpdateStatus,
};
use crate::provider::AwsClients;

/// Load credentials and settings the standard way, pinned to `region`
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

impl AwsClients {
    /// IAM, EC2 and EKS clients from a loaded AWS configuration
    pub fn from_sdk_config(config: &SdkConfig) -> Self {
        Self {
            iam: Arc::new(SdkIam::new(aws_sdk_iam::Client::new(config))),
            ec2: Arc::new(SdkEc2::new(aws_sdk_ec2::Client::new(config))),
            eks: Arc::new(SdkEks::new(aws_sdk_eks::Client::new(config))),
        }
    }
}

fn cloud_error<E, R>(service: &str, operation: &str, err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    let kind = match &err {
        SdkError::ServiceError(_) => {
            CloudErrorKind::from_code(operation, err.code().unwrap_or_default())
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            CloudErrorKind::Throttled
        }
        _ => CloudErrorKind::Other,
    };
    CloudError::new(kind, service, operation, message)
}

/// A response without a field the call always returns
fn missing_field(service: &str, operation: &str, field: &str) -> CloudError {
    CloudError::new(
        CloudErrorKind::Other,
        service,
        operation,
        format!("response has no {}", field),
    )
}

fn invalid(service: &str, operation: &str, err: impl std::fmt::Display) -> CloudError {
    CloudError::new(CloudErrorKind::InvalidParameter, service, operation, err.to_string())
}

fn timestamp(value: Option<&aws_sdk_eks::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn to_hash_map(tags: &Tags) -> HashMap<String, String> {
    tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

// =============================================================================
// IAM
// =============================================================================

/// [`IamApi`] over an IAM client
#[derive(Clone, Debug)]
pub struct SdkIam {
    client: aws_sdk_iam::Client,
}

impl SdkIam {
    /// Wrap a client
    pub fn new(client: aws_sdk_iam::Client) -> Self {
        Self { client }
    }
}

fn iam_tags(operation: &str, tags: &Tags) -> CloudResult<Vec<aws_sdk_iam::types::Tag>> {
    tags.iter()
        .map(|(k, v)| aws_sdk_iam::types::Tag::builder().key(k).value(v).build())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid("iam", operation, e))
}

fn role_of(operation: &str, role: Option<&aws_sdk_iam::types::Role>) -> CloudResult<Role> {
    let role = role.ok_or_else(|| missing_field("iam", operation, "role"))?;
    Ok(Role {
        name: role.role_name().to_string(),
        arn: role.arn().to_string(),
    })
}

fn profile_of(
    operation: &str,
    profile: Option<&aws_sdk_iam::types::InstanceProfile>,
) -> CloudResult<InstanceProfile> {
    let profile = profile.ok_or_else(|| missing_field("iam", operation, "instance profile"))?;
    Ok(InstanceProfile {
        name: profile.instance_profile_name().to_string(),
        arn: profile.arn().to_string(),
        roles: profile
            .roles()
            .iter()
            .map(|r| r.role_name().to_string())
            .collect(),
    })
}

#[async_trait]
impl IamApi for SdkIam {
    async fn create_role(&self, name: &str, trust_policy: &str, tags: &Tags) -> CloudResult<Role> {
        const OP: &str = "CreateRole";
        let output = self
            .client
            .create_role()
            .role_name(name)
            .assume_role_policy_document(trust_policy)
            .set_tags(Some(iam_tags(OP, tags)?))
            .send()
            .await
            .map_err(|e| cloud_error("iam", OP, e))?;
        role_of(OP, output.role().into())
    }

    async fn get_role(&self, name: &str) -> CloudResult<Role> {
        let output = self
            .client
            .get_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "GetRole", e))?;
        role_of("GetRole", output.role().into())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        self.client
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "AttachRolePolicy", e))?;
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<String>> {
        let mut arns = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_attached_role_policies()
                .role_name(role)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| cloud_error("iam", "ListAttachedRolePolicies", e))?;
            arns.extend(
                output
                    .attached_policies()
                    .iter()
                    .filter_map(|p| p.policy_arn().map(str::to_string)),
            );
            match output.marker() {
                Some(next) if output.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(arns)
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        self.client
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "DetachRolePolicy", e))?;
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> CloudResult<()> {
        self.client
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "DeleteRole", e))?;
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str, tags: &Tags) -> CloudResult<InstanceProfile> {
        const OP: &str = "CreateInstanceProfile";
        let output = self
            .client
            .create_instance_profile()
            .instance_profile_name(name)
            .set_tags(Some(iam_tags(OP, tags)?))
            .send()
            .await
            .map_err(|e| cloud_error("iam", OP, e))?;
        profile_of(OP, output.instance_profile().into())
    }

    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile> {
        const OP: &str = "GetInstanceProfile";
        let output = self
            .client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| cloud_error("iam", OP, e))?;
        profile_of(OP, output.instance_profile().into())
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        self.client
            .add_role_to_instance_profile()
            .instance_profile_name(profile)
            .role_name(role)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "AddRoleToInstanceProfile", e))?;
        Ok(())
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> CloudResult<()> {
        self.client
            .remove_role_from_instance_profile()
            .instance_profile_name(profile)
            .role_name(role)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "RemoveRoleFromInstanceProfile", e))?;
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()> {
        self.client
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| cloud_error("iam", "DeleteInstanceProfile", e))?;
        Ok(())
    }
}

// =============================================================================
// EC2
// =============================================================================

/// [`Ec2Api`] over an EC2 client
#[derive(Clone, Debug)]
pub struct SdkEc2 {
    client: aws_sdk_ec2::Client,
}

impl SdkEc2 {
    /// Wrap a client
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn tag_specification(resource: ResourceType, tags: &Tags) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(
            tags.iter()
                .map(|(k, v)| aws_sdk_ec2::types::Tag::builder().key(k).value(v).build())
                .collect(),
        ))
        .build()
}

fn enabled() -> AttributeBooleanValue {
    AttributeBooleanValue::builder().value(true).build()
}

fn ip_permission(rule: &SecurityRule) -> IpPermission {
    let mut permission = IpPermission::builder().ip_protocol(&rule.protocol);
    if rule.protocol != "-1" {
        permission = permission
            .from_port(i32::from(rule.from_port))
            .to_port(i32::from(rule.to_port));
    }
    match &rule.peer {
        RulePeer::SecurityGroup(group_id) => permission.user_id_group_pairs(
            UserIdGroupPair::builder()
                .group_id(group_id)
                .description(&rule.description)
                .build(),
        ),
        RulePeer::Cidr(cidr) => permission.ip_ranges(
            IpRange::builder()
                .cidr_ip(cidr)
                .description(&rule.description)
                .build(),
        ),
    }
    .build()
}

fn ip_permissions(rules: &[SecurityRule]) -> Option<Vec<IpPermission>> {
    Some(rules.iter().map(ip_permission).collect())
}

/// Revokes that match no rule succeed and list the strays instead of failing
fn unmatched(operation: &str, group_id: &str, unknown: usize) -> CloudResult<()> {
    if unknown == 0 {
        return Ok(());
    }
    Err(CloudError::new(
        CloudErrorKind::NotFound,
        "ec2",
        operation,
        format!("{} rule(s) not found in security group {}", unknown, group_id),
    ))
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn describe_availability_zones(&self) -> CloudResult<Vec<String>> {
        let output = self
            .client
            .describe_availability_zones()
            .filters(Filter::builder().name("state").values("available").build())
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DescribeAvailabilityZones", e))?;
        let mut zones: Vec<String> = output
            .availability_zones()
            .iter()
            .filter_map(|z| z.zone_name().map(str::to_string))
            .collect();
        zones.sort();
        Ok(zones)
    }

    async fn create_vpc(&self, cidr: &str, tags: &Tags) -> CloudResult<String> {
        const OP: &str = "CreateVpc";
        let output = self
            .client
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(tag_specification(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .vpc()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "vpc id"))
    }

    async fn describe_vpc_state(&self, vpc_id: &str) -> CloudResult<ResourceState> {
        let output = self
            .client
            .describe_vpcs()
            .vpc_ids(vpc_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DescribeVpcs", e))?;
        Ok(match output.vpcs().first().and_then(|v| v.state()) {
            None => ResourceState::Absent,
            Some(VpcState::Available) => ResourceState::Active,
            Some(_) => ResourceState::Provisioning,
        })
    }

    async fn enable_vpc_dns(&self, vpc_id: &str) -> CloudResult<()> {
        const OP: &str = "ModifyVpcAttribute";
        // One attribute per call
        self.client
            .modify_vpc_attribute()
            .vpc_id(vpc_id)
            .enable_dns_support(enabled())
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        self.client
            .modify_vpc_attribute()
            .vpc_id(vpc_id)
            .enable_dns_hostnames(enabled())
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()> {
        self.client
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DeleteVpc", e))?;
        Ok(())
    }

    async fn create_internet_gateway(&self, tags: &Tags) -> CloudResult<String> {
        const OP: &str = "CreateInternetGateway";
        let output = self
            .client
            .create_internet_gateway()
            .tag_specifications(tag_specification(ResourceType::InternetGateway, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "internet gateway id"))
    }

    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        self.client
            .attach_internet_gateway()
            .internet_gateway_id(igw_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "AttachInternetGateway", e))?;
        Ok(())
    }

    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        self.client
            .detach_internet_gateway()
            .internet_gateway_id(igw_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DetachInternetGateway", e))?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()> {
        self.client
            .delete_internet_gateway()
            .internet_gateway_id(igw_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DeleteInternetGateway", e))?;
        Ok(())
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
        tags: &Tags,
    ) -> CloudResult<String> {
        const OP: &str = "CreateSubnet";
        let output = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr)
            .availability_zone(availability_zone)
            .tag_specifications(tag_specification(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .subnet()
            .and_then(|s| s.subnet_id())
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "subnet id"))
    }

    async fn enable_public_ip_on_launch(&self, subnet_id: &str) -> CloudResult<()> {
        self.client
            .modify_subnet_attribute()
            .subnet_id(subnet_id)
            .map_public_ip_on_launch(enabled())
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "ModifySubnetAttribute", e))?;
        Ok(())
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        self.client
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DeleteSubnet", e))?;
        Ok(())
    }

    async fn allocate_address(&self, tags: &Tags) -> CloudResult<String> {
        const OP: &str = "AllocateAddress";
        let output = self
            .client
            .allocate_address()
            .domain(DomainType::Vpc)
            .tag_specifications(tag_specification(ResourceType::ElasticIp, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .allocation_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "allocation id"))
    }

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()> {
        self.client
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "ReleaseAddress", e))?;
        Ok(())
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        tags: &Tags,
    ) -> CloudResult<String> {
        const OP: &str = "CreateNatGateway";
        let output = self
            .client
            .create_nat_gateway()
            .subnet_id(subnet_id)
            .allocation_id(allocation_id)
            .tag_specifications(tag_specification(ResourceType::Natgateway, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .nat_gateway()
            .and_then(|n| n.nat_gateway_id())
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "nat gateway id"))
    }

    async fn describe_nat_gateway_state(&self, nat_id: &str) -> CloudResult<ResourceState> {
        let output = self
            .client
            .describe_nat_gateways()
            .nat_gateway_ids(nat_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DescribeNatGateways", e))?;
        let Some(nat) = output.nat_gateways().first() else {
            return Ok(ResourceState::Absent);
        };
        Ok(match nat.state() {
            Some(NatGatewayState::Available) => ResourceState::Active,
            Some(NatGatewayState::Deleting) => ResourceState::Deleting,
            Some(NatGatewayState::Deleted) | None => ResourceState::Absent,
            Some(NatGatewayState::Failed) => ResourceState::Failed(
                nat.failure_message()
                    .unwrap_or("NAT gateway failed")
                    .to_string(),
            ),
            Some(_) => ResourceState::Provisioning,
        })
    }

    async fn delete_nat_gateway(&self, nat_id: &str) -> CloudResult<()> {
        self.client
            .delete_nat_gateway()
            .nat_gateway_id(nat_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DeleteNatGateway", e))?;
        Ok(())
    }

    async fn create_route_table(&self, vpc_id: &str, tags: &Tags) -> CloudResult<String> {
        const OP: &str = "CreateRouteTable";
        let output = self
            .client
            .create_route_table()
            .vpc_id(vpc_id)
            .tag_specifications(tag_specification(ResourceType::RouteTable, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .route_table()
            .and_then(|t| t.route_table_id())
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "route table id"))
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> CloudResult<()> {
        let request = self
            .client
            .create_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(destination);
        let request = match target {
            RouteTarget::InternetGateway(id) => request.gateway_id(id),
            RouteTarget::NatGateway(id) => request.nat_gateway_id(id),
        };
        request
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "CreateRoute", e))?;
        Ok(())
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> CloudResult<String> {
        const OP: &str = "AssociateRouteTable";
        let output = self
            .client
            .associate_route_table()
            .route_table_id(route_table_id)
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .association_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "association id"))
    }

    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()> {
        self.client
            .disassociate_route_table()
            .association_id(association_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DisassociateRouteTable", e))?;
        Ok(())
    }

    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()> {
        self.client
            .delete_route_table()
            .route_table_id(route_table_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DeleteRouteTable", e))?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &Tags,
    ) -> CloudResult<String> {
        const OP: &str = "CreateSecurityGroup";
        let output = self
            .client
            .create_security_group()
            .vpc_id(vpc_id)
            .group_name(name)
            .description(description)
            .tag_specifications(tag_specification(ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        output
            .group_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("ec2", OP, "group id"))
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(ip_permissions(rules))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "AuthorizeSecurityGroupIngress", e))?;
        Ok(())
    }

    async fn authorize_egress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        self.client
            .authorize_security_group_egress()
            .group_id(group_id)
            .set_ip_permissions(ip_permissions(rules))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "AuthorizeSecurityGroupEgress", e))?;
        Ok(())
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        const OP: &str = "RevokeSecurityGroupIngress";
        let output = self
            .client
            .revoke_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(ip_permissions(rules))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        unmatched(OP, group_id, output.unknown_ip_permissions().len())
    }

    async fn revoke_egress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        const OP: &str = "RevokeSecurityGroupEgress";
        let output = self
            .client
            .revoke_security_group_egress()
            .group_id(group_id)
            .set_ip_permissions(ip_permissions(rules))
            .send()
            .await
            .map_err(|e| cloud_error("ec2", OP, e))?;
        unmatched(OP, group_id, output.unknown_ip_permissions().len())
    }

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(|e| cloud_error("ec2", "DeleteSecurityGroup", e))?;
        Ok(())
    }
}

// =============================================================================
// EKS
// =============================================================================

/// [`EksApi`] over an EKS client
#[derive(Clone, Debug)]
pub struct SdkEks {
    client: aws_sdk_eks::Client,
}

impl SdkEks {
    /// Wrap a client
    pub fn new(client: aws_sdk_eks::Client) -> Self {
        Self { client }
    }
}

fn control_plane_of(
    operation: &str,
    cluster: Option<&aws_sdk_eks::types::Cluster>,
) -> CloudResult<ControlPlaneDescription> {
    let cluster = cluster.ok_or_else(|| missing_field("eks", operation, "cluster"))?;
    let status = match cluster.status() {
        Some(ClusterStatus::Active) => ResourceState::Active,
        Some(ClusterStatus::Deleting) => ResourceState::Deleting,
        Some(ClusterStatus::Failed) => ResourceState::Failed("cluster failed".to_string()),
        _ => ResourceState::Provisioning,
    };
    Ok(ControlPlaneDescription {
        name: cluster.name().unwrap_or_default().to_string(),
        arn: cluster.arn().unwrap_or_default().to_string(),
        version: cluster.version().unwrap_or_default().to_string(),
        endpoint: cluster.endpoint().map(str::to_string),
        certificate_authority_data: cluster
            .certificate_authority()
            .and_then(|ca| ca.data())
            .map(str::to_string),
        status,
        created_at: timestamp(cluster.created_at()),
    })
}

fn node_group_of(operation: &str, group: Option<&Nodegroup>) -> CloudResult<NodeGroupDescription> {
    let group = group.ok_or_else(|| missing_field("eks", operation, "nodegroup"))?;
    let status = match group.status() {
        Some(NodegroupStatus::Active) | Some(NodegroupStatus::Updating) => ResourceState::Active,
        Some(NodegroupStatus::Deleting) => ResourceState::Deleting,
        Some(NodegroupStatus::CreateFailed) | Some(NodegroupStatus::DeleteFailed)
        | Some(NodegroupStatus::Degraded) => {
            let reason = group
                .health()
                .and_then(|h| h.issues().first())
                .and_then(|issue| issue.message())
                .unwrap_or("node group unhealthy");
            ResourceState::Failed(reason.to_string())
        }
        _ => ResourceState::Provisioning,
    };
    let scaling = group.scaling_config();
    let size = |value: Option<i32>| value.unwrap_or(0).max(0) as u32;
    Ok(NodeGroupDescription {
        name: group.nodegroup_name().unwrap_or_default().to_string(),
        arn: group.nodegroup_arn().unwrap_or_default().to_string(),
        status,
        instance_types: group.instance_types().to_vec(),
        scaling: NodeScaling::new(
            size(scaling.and_then(|s| s.min_size())),
            size(scaling.and_then(|s| s.max_size())),
            size(scaling.and_then(|s| s.desired_size())),
        ),
        version: group.version().unwrap_or_default().to_string(),
        created_at: timestamp(group.created_at()),
    })
}

fn scaling_config(scaling: NodeScaling) -> NodegroupScalingConfig {
    NodegroupScalingConfig::builder()
        .min_size(scaling.min_size as i32)
        .max_size(scaling.max_size as i32)
        .desired_size(scaling.desired_size as i32)
        .build()
}

fn update_id(
    operation: &str,
    update: Option<&aws_sdk_eks::types::Update>,
) -> CloudResult<String> {
    update
        .and_then(|u| u.id())
        .map(str::to_string)
        .ok_or_else(|| missing_field("eks", operation, "update id"))
}

#[async_trait]
impl EksApi for SdkEks {
    async fn create_cluster(
        &self,
        request: &ControlPlaneRequest,
    ) -> CloudResult<ControlPlaneDescription> {
        const OP: &str = "CreateCluster";
        let vpc = VpcConfigRequest::builder()
            .set_subnet_ids(Some(request.subnet_ids.clone()))
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .endpoint_public_access(true)
            .endpoint_private_access(true)
            .build();
        let mut builder = self
            .client
            .create_cluster()
            .name(&request.name)
            .version(&request.version)
            .role_arn(&request.role_arn)
            .resources_vpc_config(vpc)
            .set_tags(Some(to_hash_map(&request.tags)));
        if !request.log_types.is_empty() {
            let types = request
                .log_types
                .iter()
                .map(|t| LogType::from(t.as_str()))
                .collect();
            builder = builder.logging(
                Logging::builder()
                    .cluster_logging(LogSetup::builder().set_types(Some(types)).enabled(true).build())
                    .build(),
            );
        }
        let output = builder.send().await.map_err(|e| cloud_error("eks", OP, e))?;
        debug!(cluster = %request.name, "CreateCluster accepted");
        control_plane_of(OP, output.cluster())
    }

    async fn describe_cluster(&self, name: &str) -> CloudResult<ControlPlaneDescription> {
        const OP: &str = "DescribeCluster";
        let output = self
            .client
            .describe_cluster()
            .name(name)
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        control_plane_of(OP, output.cluster())
    }

    async fn delete_cluster(&self, name: &str) -> CloudResult<()> {
        self.client
            .delete_cluster()
            .name(name)
            .send()
            .await
            .map_err(|e| cloud_error("eks", "DeleteCluster", e))?;
        Ok(())
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> CloudResult<String> {
        const OP: &str = "UpdateClusterVersion";
        let output = self
            .client
            .update_cluster_version()
            .name(name)
            .version(version)
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        update_id(OP, output.update())
    }

    async fn create_nodegroup(&self, request: &NodeGroupRequest) -> CloudResult<NodeGroupDescription> {
        const OP: &str = "CreateNodegroup";
        let disk_size = i32::try_from(request.disk_size_gb).map_err(|e| invalid("eks", OP, e))?;
        let output = self
            .client
            .create_nodegroup()
            .cluster_name(&request.cluster)
            .nodegroup_name(&request.name)
            .node_role(&request.node_role_arn)
            .set_subnets(Some(request.subnet_ids.clone()))
            .set_instance_types(Some(request.instance_types.clone()))
            .disk_size(disk_size)
            .scaling_config(scaling_config(request.scaling))
            .set_labels(Some(
                request
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
            .set_tags(Some(to_hash_map(&request.tags)))
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        node_group_of(OP, output.nodegroup())
    }

    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<NodeGroupDescription> {
        const OP: &str = "DescribeNodegroup";
        let output = self
            .client
            .describe_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        node_group_of(OP, output.nodegroup())
    }

    async fn update_nodegroup_config(
        &self,
        cluster: &str,
        name: &str,
        scaling: NodeScaling,
    ) -> CloudResult<String> {
        const OP: &str = "UpdateNodegroupConfig";
        let output = self
            .client
            .update_nodegroup_config()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .scaling_config(scaling_config(scaling))
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        update_id(OP, output.update())
    }

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()> {
        self.client
            .delete_nodegroup()
            .cluster_name(cluster)
            .nodegroup_name(name)
            .send()
            .await
            .map_err(|e| cloud_error("eks", "DeleteNodegroup", e))?;
        Ok(())
    }

    async fn describe_update(
        &self,
        cluster: &str,
        nodegroup: Option<String>,
        update_id: &str,
    ) -> CloudResult<UpdateStatus> {
        const OP: &str = "DescribeUpdate";
        let output = self
            .client
            .describe_update()
            .name(cluster)
            .set_nodegroup_name(nodegroup)
            .update_id(update_id)
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        let update = output
            .update()
            .ok_or_else(|| missing_field("eks", OP, "update"))?;
        Ok(match update.status() {
            Some(EksUpdateStatus::Successful) => UpdateStatus::Successful,
            Some(EksUpdateStatus::Cancelled) => UpdateStatus::Cancelled,
            Some(EksUpdateStatus::Failed) => UpdateStatus::Failed(
                update
                    .errors()
                    .iter()
                    .filter_map(|e| e.error_message())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => UpdateStatus::InProgress,
        })
    }

    async fn create_addon(&self, cluster: &str, addon: &str) -> CloudResult<()> {
        self.client
            .create_addon()
            .cluster_name(cluster)
            .addon_name(addon)
            .send()
            .await
            .map_err(|e| cloud_error("eks", "CreateAddon", e))?;
        Ok(())
    }

    async fn describe_addon(&self, cluster: &str, addon: &str) -> CloudResult<ResourceState> {
        const OP: &str = "DescribeAddon";
        let output = self
            .client
            .describe_addon()
            .cluster_name(cluster)
            .addon_name(addon)
            .send()
            .await
            .map_err(|e| cloud_error("eks", OP, e))?;
        Ok(match output.addon().and_then(|a| a.status()) {
            Some(AddonStatus::Active) => ResourceState::Active,
            Some(AddonStatus::Deleting) => ResourceState::Deleting,
            Some(AddonStatus::CreateFailed) | Some(AddonStatus::Degraded) => {
                ResourceState::Failed(format!("addon {} is unhealthy", addon))
            }
            _ => ResourceState::Provisioning,
        })
    }
}
