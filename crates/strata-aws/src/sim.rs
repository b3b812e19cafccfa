//! In-process simulated AWS account
//!
//! Implements [`IamApi`], [`Ec2Api`] and [`EksApi`] over a single mutex-guarded
//! model. Long-running resources report intermediate states for a configurable
//! number of polls before converging, and deletes enforce the same dependency
//! rules the real services do, so teardown ordering mistakes surface as
//! `DependencyViolation` errors.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;

use strata_common::lifecycle::ResourceState;
use strata_common::provider::NodeScaling;

use crate::api::{
    CloudError, CloudErrorKind, CloudResult, ControlPlaneDescription, ControlPlaneRequest,
    Ec2Api, EksApi, IamApi, InstanceProfile, NodeGroupDescription, NodeGroupRequest, Role,
    RouteTarget, RulePeer, SecurityRule, Tags, UpdateStatus,
};

const ACCOUNT_ID: &str = "123456789012";

/// A resource converging toward a target state over a number of polls
#[derive(Clone, Debug)]
struct Progress {
    state: ResourceState,
    polls_left: u32,
}

impl Progress {
    fn provisioning(polls: u32) -> Self {
        Self {
            state: ResourceState::Provisioning,
            polls_left: polls,
        }
    }

    fn deleting(polls: u32) -> Self {
        Self {
            state: ResourceState::Deleting,
            polls_left: polls,
        }
    }

    /// Observe once; returns the state after this poll
    fn poll(&mut self) -> ResourceState {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return self.state.clone();
        }
        match self.state {
            ResourceState::Provisioning => self.state = ResourceState::Active,
            ResourceState::Deleting => self.state = ResourceState::Absent,
            _ => {}
        }
        self.state.clone()
    }
}

#[derive(Debug)]
struct SimRole {
    role: Role,
    policies: BTreeSet<String>,
}

#[derive(Debug)]
struct SimNat {
    subnet_id: String,
    allocation_id: String,
    progress: Progress,
}

#[derive(Debug)]
struct SimRouteTable {
    vpc_id: String,
    routes: Vec<(String, RouteTarget)>,
}

#[derive(Debug)]
struct SimSecurityGroup {
    vpc_id: String,
    name: String,
    ingress: Vec<SecurityRule>,
    egress: Vec<SecurityRule>,
}

#[derive(Debug)]
struct SimCluster {
    description: ControlPlaneDescription,
    subnet_ids: Vec<String>,
    security_group_ids: Vec<String>,
    progress: Progress,
}

#[derive(Debug)]
struct SimNodeGroup {
    description: NodeGroupDescription,
    progress: Progress,
}

#[derive(Debug)]
enum UpdateEffect {
    Version(String),
    Scaling(String, NodeScaling),
}

#[derive(Debug)]
struct SimUpdate {
    cluster: String,
    effect: UpdateEffect,
    polls_left: u32,
    status: UpdateStatus,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    calls: Vec<String>,
    faults: HashMap<String, VecDeque<CloudErrorKind>>,

    roles: BTreeMap<String, SimRole>,
    profiles: BTreeMap<String, InstanceProfile>,

    vpcs: BTreeMap<String, Progress>,
    internet_gateways: BTreeMap<String, Option<String>>,
    subnets: BTreeMap<String, String>,
    addresses: BTreeSet<String>,
    nat_gateways: BTreeMap<String, SimNat>,
    route_tables: BTreeMap<String, SimRouteTable>,
    associations: BTreeMap<String, (String, String)>,
    security_groups: BTreeMap<String, SimSecurityGroup>,

    clusters: BTreeMap<String, SimCluster>,
    node_groups: BTreeMap<(String, String), SimNodeGroup>,
    addons: BTreeMap<(String, String), Progress>,
    updates: BTreeMap<String, SimUpdate>,
}

impl SimState {
    /// Log a call and pop an injected fault for it, if any
    fn call(&mut self, service: &str, operation: &str) -> CloudResult<()> {
        let key = format!("{}:{}", service, operation);
        self.calls.push(key.clone());
        match self.faults.get_mut(&key).and_then(|q| q.pop_front()) {
            Some(kind) => Err(CloudError::new(kind, service, operation, "injected fault")),
            None => Ok(()),
        }
    }

    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }
}

fn err(
    kind: CloudErrorKind,
    service: &str,
    operation: &str,
    message: impl Into<String>,
) -> CloudError {
    CloudError::new(kind, service, operation, message)
}

fn missing(service: &str, operation: &str, what: &str, id: &str) -> CloudError {
    err(
        CloudErrorKind::NotFound,
        service,
        operation,
        format!("{} {} does not exist", what, id),
    )
}

fn in_use(service: &str, operation: &str, id: &str, by: impl std::fmt::Display) -> CloudError {
    err(
        CloudErrorKind::DependencyViolation,
        service,
        operation,
        format!("{} has a dependent object: {}", id, by),
    )
}

/// Remove `rules` from a rule list; all must be present or nothing changes
fn revoke(
    current: &mut Vec<SecurityRule>,
    rules: &[SecurityRule],
    operation: &str,
    group_id: &str,
) -> CloudResult<()> {
    if let Some(absent) = rules.iter().find(|rule| !current.contains(rule)) {
        return Err(err(
            CloudErrorKind::NotFound,
            "ec2",
            operation,
            format!(
                "rule '{}' not found in security group {}",
                absent.description, group_id
            ),
        ));
    }
    current.retain(|rule| !rules.contains(rule));
    Ok(())
}

/// A simulated AWS account for one region
pub struct SimulatedCloud {
    region: String,
    zones: Vec<String>,
    polls_to_ready: u32,
    state: Mutex<SimState>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    /// us-east-1 with six zones; resources converge after one intermediate poll
    pub fn new() -> Self {
        let region = "us-east-1".to_string();
        let zones = ('a'..='f').map(|z| format!("{}{}", region, z)).collect();
        Self {
            region,
            zones,
            polls_to_ready: 1,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Use a different region; zones are renamed to match
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        let count = self.zones.len();
        self.zones = ('a'..='z')
            .take(count)
            .map(|z| format!("{}{}", self.region, z))
            .collect();
        self
    }

    /// Offer exactly these availability zones
    pub fn with_zones(mut self, zones: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.zones = zones.into_iter().map(Into::into).collect();
        self
    }

    /// Number of intermediate polls before a resource converges
    pub fn with_polls_to_ready(mut self, polls: u32) -> Self {
        self.polls_to_ready = polls;
        self
    }

    /// Fail the next call to `operation` (e.g. "ec2:CreateNatGateway") with `kind`
    pub fn fail_next(&self, operation: &str, kind: CloudErrorKind) {
        self.state
            .lock()
            .faults
            .entry(operation.to_string())
            .or_default()
            .push_back(kind);
    }

    /// Every call made so far, as "service:Operation"
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of calls to one operation
    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    /// Forget the call log
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Resources that still exist and would be billed or block reuse
    pub fn live_resource_count(&self) -> usize {
        let s = self.state.lock();
        s.roles.len()
            + s.profiles.len()
            + s.vpcs.len()
            + s.internet_gateways.len()
            + s.subnets.len()
            + s.addresses.len()
            + s.nat_gateways
                .values()
                .filter(|n| n.progress.state != ResourceState::Absent)
                .count()
            + s.route_tables.len()
            + s.security_groups.len()
            + s.clusters.len()
            + s.node_groups.len()
    }

    /// Current desired size of a node group
    pub fn node_group_scaling(&self, cluster: &str, name: &str) -> Option<NodeScaling> {
        self.state
            .lock()
            .node_groups
            .get(&(cluster.to_string(), name.to_string()))
            .map(|g| g.description.scaling)
    }

    /// Current control plane version
    pub fn cluster_version(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .clusters
            .get(name)
            .map(|c| c.description.version.clone())
    }

    /// Route targets of a route table
    pub fn routes(&self, route_table_id: &str) -> Vec<RouteTarget> {
        self.state
            .lock()
            .route_tables
            .get(route_table_id)
            .map(|t| t.routes.iter().map(|(_, target)| target.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of security groups
    pub fn security_group_names(&self) -> Vec<String> {
        self.state
            .lock()
            .security_groups
            .values()
            .map(|g| g.name.clone())
            .collect()
    }

    /// Ingress and egress rules of a security group
    pub fn security_group_rules(&self, group_id: &str) -> (Vec<SecurityRule>, Vec<SecurityRule>) {
        self.state
            .lock()
            .security_groups
            .get(group_id)
            .map(|g| (g.ingress.clone(), g.egress.clone()))
            .unwrap_or_default()
    }

    fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, name)
    }

    fn endpoint(&self, id: &str) -> String {
        format!(
            "https://{}.gr7.{}.eks.amazonaws.com",
            id.trim_start_matches("eks-").to_uppercase(),
            self.region
        )
    }
}

// =============================================================================
// IAM
// =============================================================================

#[async_trait]
impl IamApi for SimulatedCloud {
    async fn create_role(&self, name: &str, _trust_policy: &str, _tags: &Tags) -> CloudResult<Role> {
        let mut s = self.state.lock();
        s.call("iam", "CreateRole")?;
        if s.roles.contains_key(name) {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "iam",
                "CreateRole",
                format!("Role with name {} already exists", name),
            ));
        }
        let role = Role {
            name: name.to_string(),
            arn: self.role_arn(name),
        };
        s.roles.insert(
            name.to_string(),
            SimRole {
                role: role.clone(),
                policies: BTreeSet::new(),
            },
        );
        Ok(role)
    }

    async fn get_role(&self, name: &str) -> CloudResult<Role> {
        let mut s = self.state.lock();
        s.call("iam", "GetRole")?;
        s.roles
            .get(name)
            .map(|r| r.role.clone())
            .ok_or_else(|| missing("iam", "GetRole", "role", name))
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("iam", "AttachRolePolicy")?;
        let record = s
            .roles
            .get_mut(role)
            .ok_or_else(|| missing("iam", "AttachRolePolicy", "role", role))?;
        record.policies.insert(policy_arn.to_string());
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<String>> {
        let mut s = self.state.lock();
        s.call("iam", "ListAttachedRolePolicies")?;
        s.roles
            .get(role)
            .map(|r| r.policies.iter().cloned().collect())
            .ok_or_else(|| missing("iam", "ListAttachedRolePolicies", "role", role))
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("iam", "DetachRolePolicy")?;
        let record = s
            .roles
            .get_mut(role)
            .ok_or_else(|| missing("iam", "DetachRolePolicy", "role", role))?;
        if !record.policies.remove(policy_arn) {
            return Err(missing("iam", "DetachRolePolicy", "policy attachment", policy_arn));
        }
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("iam", "DeleteRole")?;
        let record = s
            .roles
            .get(name)
            .ok_or_else(|| missing("iam", "DeleteRole", "role", name))?;
        if let Some(policy) = record.policies.iter().next() {
            return Err(in_use("iam", "DeleteRole", name, policy));
        }
        if let Some(profile) = s.profiles.values().find(|p| p.roles.iter().any(|r| r == name)) {
            return Err(in_use("iam", "DeleteRole", name, &profile.name));
        }
        s.roles.remove(name);
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str, _tags: &Tags) -> CloudResult<InstanceProfile> {
        let mut s = self.state.lock();
        s.call("iam", "CreateInstanceProfile")?;
        if s.profiles.contains_key(name) {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "iam",
                "CreateInstanceProfile",
                format!("Instance Profile {} already exists", name),
            ));
        }
        let profile = InstanceProfile {
            name: name.to_string(),
            arn: format!("arn:aws:iam::{}:instance-profile/{}", ACCOUNT_ID, name),
            roles: Vec::new(),
        };
        s.profiles.insert(name.to_string(), profile.clone());
        Ok(profile)
    }

    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile> {
        let mut s = self.state.lock();
        s.call("iam", "GetInstanceProfile")?;
        s.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| missing("iam", "GetInstanceProfile", "instance profile", name))
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("iam", "AddRoleToInstanceProfile")?;
        if !s.roles.contains_key(role) {
            return Err(missing("iam", "AddRoleToInstanceProfile", "role", role));
        }
        let record = s
            .profiles
            .get_mut(profile)
            .ok_or_else(|| missing("iam", "AddRoleToInstanceProfile", "instance profile", profile))?;
        if !record.roles.is_empty() {
            return Err(err(
                CloudErrorKind::LimitExceeded,
                "iam",
                "AddRoleToInstanceProfile",
                "Cannot exceed quota for InstanceSessionsPerInstanceProfile: 1",
            ));
        }
        record.roles.push(role.to_string());
        Ok(())
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("iam", "RemoveRoleFromInstanceProfile")?;
        let record = s.profiles.get_mut(profile).ok_or_else(|| {
            missing("iam", "RemoveRoleFromInstanceProfile", "instance profile", profile)
        })?;
        let before = record.roles.len();
        record.roles.retain(|r| r != role);
        if record.roles.len() == before {
            return Err(missing("iam", "RemoveRoleFromInstanceProfile", "role", role));
        }
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("iam", "DeleteInstanceProfile")?;
        let record = s
            .profiles
            .get(name)
            .ok_or_else(|| missing("iam", "DeleteInstanceProfile", "instance profile", name))?;
        if let Some(role) = record.roles.first() {
            return Err(in_use("iam", "DeleteInstanceProfile", name, role));
        }
        s.profiles.remove(name);
        Ok(())
    }
}

// =============================================================================
// EC2
// =============================================================================

#[async_trait]
impl Ec2Api for SimulatedCloud {
    async fn describe_availability_zones(&self) -> CloudResult<Vec<String>> {
        let mut s = self.state.lock();
        s.call("ec2", "DescribeAvailabilityZones")?;
        Ok(self.zones.clone())
    }

    async fn create_vpc(&self, _cidr: &str, _tags: &Tags) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateVpc")?;
        let id = s.id("vpc");
        s.vpcs
            .insert(id.clone(), Progress::provisioning(self.polls_to_ready));
        Ok(id)
    }

    async fn describe_vpc_state(&self, vpc_id: &str) -> CloudResult<ResourceState> {
        let mut s = self.state.lock();
        s.call("ec2", "DescribeVpcs")?;
        s.vpcs
            .get_mut(vpc_id)
            .map(Progress::poll)
            .ok_or_else(|| missing("ec2", "DescribeVpcs", "vpc", vpc_id))
    }

    async fn enable_vpc_dns(&self, vpc_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "ModifyVpcAttribute")?;
        if !s.vpcs.contains_key(vpc_id) {
            return Err(missing("ec2", "ModifyVpcAttribute", "vpc", vpc_id));
        }
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DeleteVpc")?;
        if !s.vpcs.contains_key(vpc_id) {
            return Err(missing("ec2", "DeleteVpc", "vpc", vpc_id));
        }
        let attached = s
            .internet_gateways
            .iter()
            .find(|(_, vpc)| vpc.as_deref() == Some(vpc_id))
            .map(|(id, _)| id.clone());
        let dependent = attached
            .or_else(|| s.subnets.iter().find(|(_, v)| *v == vpc_id).map(|(id, _)| id.clone()))
            .or_else(|| {
                s.route_tables
                    .iter()
                    .find(|(_, t)| t.vpc_id == vpc_id)
                    .map(|(id, _)| id.clone())
            })
            .or_else(|| {
                s.security_groups
                    .iter()
                    .find(|(_, g)| g.vpc_id == vpc_id)
                    .map(|(id, _)| id.clone())
            });
        if let Some(dependent) = dependent {
            return Err(in_use("ec2", "DeleteVpc", vpc_id, dependent));
        }
        s.vpcs.remove(vpc_id);
        Ok(())
    }

    async fn create_internet_gateway(&self, _tags: &Tags) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateInternetGateway")?;
        let id = s.id("igw");
        s.internet_gateways.insert(id.clone(), None);
        Ok(id)
    }

    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "AttachInternetGateway")?;
        if !s.vpcs.contains_key(vpc_id) {
            return Err(missing("ec2", "AttachInternetGateway", "vpc", vpc_id));
        }
        let attachment = s
            .internet_gateways
            .get_mut(igw_id)
            .ok_or_else(|| missing("ec2", "AttachInternetGateway", "internet gateway", igw_id))?;
        *attachment = Some(vpc_id.to_string());
        Ok(())
    }

    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DetachInternetGateway")?;
        let attachment = s
            .internet_gateways
            .get_mut(igw_id)
            .ok_or_else(|| missing("ec2", "DetachInternetGateway", "internet gateway", igw_id))?;
        if attachment.as_deref() != Some(vpc_id) {
            return Err(missing("ec2", "DetachInternetGateway", "attachment", igw_id));
        }
        *attachment = None;
        Ok(())
    }

    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DeleteInternetGateway")?;
        match s.internet_gateways.get(igw_id) {
            None => Err(missing("ec2", "DeleteInternetGateway", "internet gateway", igw_id)),
            Some(Some(vpc)) => Err(in_use("ec2", "DeleteInternetGateway", igw_id, vpc)),
            Some(None) => {
                s.internet_gateways.remove(igw_id);
                Ok(())
            }
        }
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        _cidr: &str,
        availability_zone: &str,
        _tags: &Tags,
    ) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateSubnet")?;
        if !s.vpcs.contains_key(vpc_id) {
            return Err(missing("ec2", "CreateSubnet", "vpc", vpc_id));
        }
        if !self.zones.iter().any(|z| z == availability_zone) {
            return Err(err(
                CloudErrorKind::InvalidParameter,
                "ec2",
                "CreateSubnet",
                format!("invalid availability zone {}", availability_zone),
            ));
        }
        let id = s.id("subnet");
        s.subnets.insert(id.clone(), vpc_id.to_string());
        Ok(id)
    }

    async fn enable_public_ip_on_launch(&self, subnet_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "ModifySubnetAttribute")?;
        if !s.subnets.contains_key(subnet_id) {
            return Err(missing("ec2", "ModifySubnetAttribute", "subnet", subnet_id));
        }
        Ok(())
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DeleteSubnet")?;
        if !s.subnets.contains_key(subnet_id) {
            return Err(missing("ec2", "DeleteSubnet", "subnet", subnet_id));
        }
        if let Some((nat_id, _)) = s.nat_gateways.iter().find(|(_, n)| {
            n.subnet_id == subnet_id && n.progress.state != ResourceState::Absent
        }) {
            return Err(in_use("ec2", "DeleteSubnet", subnet_id, nat_id));
        }
        if let Some(cluster) = s
            .clusters
            .values()
            .find(|c| c.subnet_ids.iter().any(|id| id == subnet_id))
        {
            return Err(in_use("ec2", "DeleteSubnet", subnet_id, &cluster.description.name));
        }
        s.subnets.remove(subnet_id);
        s.associations.retain(|_, (_, subnet)| subnet != subnet_id);
        Ok(())
    }

    async fn allocate_address(&self, _tags: &Tags) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "AllocateAddress")?;
        let id = s.id("eipalloc");
        s.addresses.insert(id.clone());
        Ok(id)
    }

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "ReleaseAddress")?;
        if !s.addresses.contains(allocation_id) {
            return Err(missing("ec2", "ReleaseAddress", "address", allocation_id));
        }
        if let Some((nat_id, _)) = s.nat_gateways.iter().find(|(_, n)| {
            n.allocation_id == allocation_id && n.progress.state != ResourceState::Absent
        }) {
            return Err(in_use("ec2", "ReleaseAddress", allocation_id, nat_id));
        }
        s.addresses.remove(allocation_id);
        Ok(())
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        _tags: &Tags,
    ) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateNatGateway")?;
        if !s.subnets.contains_key(subnet_id) {
            return Err(missing("ec2", "CreateNatGateway", "subnet", subnet_id));
        }
        if !s.addresses.contains(allocation_id) {
            return Err(missing("ec2", "CreateNatGateway", "address", allocation_id));
        }
        let id = s.id("nat");
        s.nat_gateways.insert(
            id.clone(),
            SimNat {
                subnet_id: subnet_id.to_string(),
                allocation_id: allocation_id.to_string(),
                progress: Progress::provisioning(self.polls_to_ready),
            },
        );
        Ok(id)
    }

    async fn describe_nat_gateway_state(&self, nat_id: &str) -> CloudResult<ResourceState> {
        let mut s = self.state.lock();
        s.call("ec2", "DescribeNatGateways")?;
        s.nat_gateways
            .get_mut(nat_id)
            .map(|n| n.progress.poll())
            .ok_or_else(|| missing("ec2", "DescribeNatGateways", "nat gateway", nat_id))
    }

    async fn delete_nat_gateway(&self, nat_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DeleteNatGateway")?;
        let nat = s
            .nat_gateways
            .get_mut(nat_id)
            .ok_or_else(|| missing("ec2", "DeleteNatGateway", "nat gateway", nat_id))?;
        // Deleted gateways stay visible in the Absent state, as AWS reports them.
        if nat.progress.state != ResourceState::Absent {
            nat.progress = Progress::deleting(self.polls_to_ready);
        }
        Ok(())
    }

    async fn create_route_table(&self, vpc_id: &str, _tags: &Tags) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateRouteTable")?;
        if !s.vpcs.contains_key(vpc_id) {
            return Err(missing("ec2", "CreateRouteTable", "vpc", vpc_id));
        }
        let id = s.id("rtb");
        s.route_tables.insert(
            id.clone(),
            SimRouteTable {
                vpc_id: vpc_id.to_string(),
                routes: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target: &RouteTarget,
    ) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateRoute")?;
        let target_exists = match target {
            RouteTarget::InternetGateway(id) => s.internet_gateways.contains_key(id),
            RouteTarget::NatGateway(id) => s.nat_gateways.contains_key(id),
        };
        if !target_exists {
            return Err(missing("ec2", "CreateRoute", "route target", &format!("{:?}", target)));
        }
        let table = s
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| missing("ec2", "CreateRoute", "route table", route_table_id))?;
        if table.routes.iter().any(|(d, _)| d == destination) {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "ec2",
                "CreateRoute",
                format!("route for {} already exists", destination),
            ));
        }
        table.routes.push((destination.to_string(), target.clone()));
        Ok(())
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "AssociateRouteTable")?;
        if !s.route_tables.contains_key(route_table_id) {
            return Err(missing("ec2", "AssociateRouteTable", "route table", route_table_id));
        }
        if !s.subnets.contains_key(subnet_id) {
            return Err(missing("ec2", "AssociateRouteTable", "subnet", subnet_id));
        }
        let id = s.id("rtbassoc");
        s.associations
            .insert(id.clone(), (route_table_id.to_string(), subnet_id.to_string()));
        Ok(id)
    }

    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DisassociateRouteTable")?;
        s.associations
            .remove(association_id)
            .map(|_| ())
            .ok_or_else(|| missing("ec2", "DisassociateRouteTable", "association", association_id))
    }

    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DeleteRouteTable")?;
        if !s.route_tables.contains_key(route_table_id) {
            return Err(missing("ec2", "DeleteRouteTable", "route table", route_table_id));
        }
        if let Some((assoc, _)) = s
            .associations
            .iter()
            .find(|(_, (table, _))| table == route_table_id)
        {
            return Err(in_use("ec2", "DeleteRouteTable", route_table_id, assoc));
        }
        s.route_tables.remove(route_table_id);
        Ok(())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        _description: &str,
        _tags: &Tags,
    ) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("ec2", "CreateSecurityGroup")?;
        if !s.vpcs.contains_key(vpc_id) {
            return Err(missing("ec2", "CreateSecurityGroup", "vpc", vpc_id));
        }
        if s
            .security_groups
            .values()
            .any(|g| g.vpc_id == vpc_id && g.name == name)
        {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "ec2",
                "CreateSecurityGroup",
                format!("security group {} already exists", name),
            ));
        }
        let id = s.id("sg");
        s.security_groups.insert(
            id.clone(),
            SimSecurityGroup {
                vpc_id: vpc_id.to_string(),
                name: name.to_string(),
                ingress: Vec::new(),
                egress: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "AuthorizeSecurityGroupIngress")?;
        let group = s.security_groups.get_mut(group_id).ok_or_else(|| {
            missing("ec2", "AuthorizeSecurityGroupIngress", "security group", group_id)
        })?;
        group.ingress.extend_from_slice(rules);
        Ok(())
    }

    async fn authorize_egress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "AuthorizeSecurityGroupEgress")?;
        let group = s.security_groups.get_mut(group_id).ok_or_else(|| {
            missing("ec2", "AuthorizeSecurityGroupEgress", "security group", group_id)
        })?;
        group.egress.extend_from_slice(rules);
        Ok(())
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "RevokeSecurityGroupIngress")?;
        let group = s.security_groups.get_mut(group_id).ok_or_else(|| {
            missing("ec2", "RevokeSecurityGroupIngress", "security group", group_id)
        })?;
        revoke(&mut group.ingress, rules, "RevokeSecurityGroupIngress", group_id)
    }

    async fn revoke_egress(&self, group_id: &str, rules: &[SecurityRule]) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "RevokeSecurityGroupEgress")?;
        let group = s.security_groups.get_mut(group_id).ok_or_else(|| {
            missing("ec2", "RevokeSecurityGroupEgress", "security group", group_id)
        })?;
        revoke(&mut group.egress, rules, "RevokeSecurityGroupEgress", group_id)
    }

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("ec2", "DeleteSecurityGroup")?;
        if !s.security_groups.contains_key(group_id) {
            return Err(missing("ec2", "DeleteSecurityGroup", "security group", group_id));
        }
        if let Some(cluster) = s
            .clusters
            .values()
            .find(|c| c.security_group_ids.iter().any(|id| id == group_id))
        {
            return Err(in_use(
                "ec2",
                "DeleteSecurityGroup",
                group_id,
                &cluster.description.name,
            ));
        }
        let referenced = RulePeer::SecurityGroup(group_id.to_string());
        if let Some((other, _)) = s.security_groups.iter().find(|(id, group)| {
            id.as_str() != group_id
                && group
                    .ingress
                    .iter()
                    .chain(&group.egress)
                    .any(|rule| rule.peer == referenced)
        }) {
            return Err(in_use("ec2", "DeleteSecurityGroup", group_id, other));
        }
        s.security_groups.remove(group_id);
        Ok(())
    }
}

// =============================================================================
// EKS
// =============================================================================

#[async_trait]
impl EksApi for SimulatedCloud {
    async fn create_cluster(
        &self,
        request: &ControlPlaneRequest,
    ) -> CloudResult<ControlPlaneDescription> {
        let mut s = self.state.lock();
        s.call("eks", "CreateCluster")?;
        if s.clusters.contains_key(&request.name) {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "eks",
                "CreateCluster",
                format!("Cluster already exists with name: {}", request.name),
            ));
        }
        if !s.roles.values().any(|r| r.role.arn == request.role_arn) {
            return Err(err(
                CloudErrorKind::InvalidParameter,
                "eks",
                "CreateCluster",
                format!("role {} does not exist", request.role_arn),
            ));
        }
        if let Some(subnet) = request.subnet_ids.iter().find(|id| !s.subnets.contains_key(*id)) {
            return Err(err(
                CloudErrorKind::InvalidParameter,
                "eks",
                "CreateCluster",
                format!("subnet {} does not exist", subnet),
            ));
        }

        let description = ControlPlaneDescription {
            name: request.name.clone(),
            arn: format!(
                "arn:aws:eks:{}:{}:cluster/{}",
                self.region, ACCOUNT_ID, request.name
            ),
            version: request.version.clone(),
            endpoint: None,
            certificate_authority_data: None,
            status: ResourceState::Provisioning,
            created_at: Utc::now(),
        };
        s.clusters.insert(
            request.name.clone(),
            SimCluster {
                description: description.clone(),
                subnet_ids: request.subnet_ids.clone(),
                security_group_ids: request.security_group_ids.clone(),
                progress: Progress::provisioning(self.polls_to_ready),
            },
        );
        Ok(description)
    }

    async fn describe_cluster(&self, name: &str) -> CloudResult<ControlPlaneDescription> {
        let mut s = self.state.lock();
        s.call("eks", "DescribeCluster")?;
        let id = s.id("eks");
        let cluster = s
            .clusters
            .get_mut(name)
            .ok_or_else(|| missing("eks", "DescribeCluster", "cluster", name))?;
        let state = cluster.progress.poll();
        if state == ResourceState::Absent {
            s.clusters.remove(name);
            return Err(missing("eks", "DescribeCluster", "cluster", name));
        }
        if state == ResourceState::Active && cluster.description.endpoint.is_none() {
            cluster.description.endpoint = Some(self.endpoint(&id));
            cluster.description.certificate_authority_data = Some(
                base64::engine::general_purpose::STANDARD.encode(format!(
                    "-----BEGIN CERTIFICATE-----\nsimulated {}\n-----END CERTIFICATE-----\n",
                    name
                )),
            );
        }
        cluster.description.status = state;
        Ok(cluster.description.clone())
    }

    async fn delete_cluster(&self, name: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("eks", "DeleteCluster")?;
        if !s.clusters.contains_key(name) {
            return Err(missing("eks", "DeleteCluster", "cluster", name));
        }
        if let Some((_, group)) = s.node_groups.keys().find(|(cluster, _)| cluster == name) {
            return Err(in_use("eks", "DeleteCluster", name, group));
        }
        if let Some(cluster) = s.clusters.get_mut(name) {
            cluster.progress = Progress::deleting(self.polls_to_ready);
        }
        s.addons.retain(|(cluster, _), _| cluster != name);
        Ok(())
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("eks", "UpdateClusterVersion")?;
        let current = s
            .clusters
            .get(name)
            .map(|c| c.description.version.clone())
            .ok_or_else(|| missing("eks", "UpdateClusterVersion", "cluster", name))?;
        if current == version {
            return Err(err(
                CloudErrorKind::InvalidParameter,
                "eks",
                "UpdateClusterVersion",
                format!("cluster is already at version {}", version),
            ));
        }
        let id = s.id("update");
        s.updates.insert(
            id.clone(),
            SimUpdate {
                cluster: name.to_string(),
                effect: UpdateEffect::Version(version.to_string()),
                polls_left: self.polls_to_ready,
                status: UpdateStatus::InProgress,
            },
        );
        Ok(id)
    }

    async fn create_nodegroup(&self, request: &NodeGroupRequest) -> CloudResult<NodeGroupDescription> {
        let mut s = self.state.lock();
        s.call("eks", "CreateNodegroup")?;
        let version = s
            .clusters
            .get(&request.cluster)
            .map(|c| c.description.version.clone())
            .ok_or_else(|| missing("eks", "CreateNodegroup", "cluster", &request.cluster))?;
        let key = (request.cluster.clone(), request.name.clone());
        if s.node_groups.contains_key(&key) {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "eks",
                "CreateNodegroup",
                format!("NodeGroup already exists with name {}", request.name),
            ));
        }
        let description = NodeGroupDescription {
            name: request.name.clone(),
            arn: format!(
                "arn:aws:eks:{}:{}:nodegroup/{}/{}",
                self.region, ACCOUNT_ID, request.cluster, request.name
            ),
            status: ResourceState::Provisioning,
            instance_types: request.instance_types.clone(),
            scaling: request.scaling,
            version,
            created_at: Utc::now(),
        };
        s.node_groups.insert(
            key,
            SimNodeGroup {
                description: description.clone(),
                progress: Progress::provisioning(self.polls_to_ready),
            },
        );
        Ok(description)
    }

    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<NodeGroupDescription> {
        let mut s = self.state.lock();
        s.call("eks", "DescribeNodegroup")?;
        let key = (cluster.to_string(), name.to_string());
        let group = s
            .node_groups
            .get_mut(&key)
            .ok_or_else(|| missing("eks", "DescribeNodegroup", "node group", name))?;
        let state = group.progress.poll();
        if state == ResourceState::Absent {
            s.node_groups.remove(&key);
            return Err(missing("eks", "DescribeNodegroup", "node group", name));
        }
        group.description.status = state;
        Ok(group.description.clone())
    }

    async fn update_nodegroup_config(
        &self,
        cluster: &str,
        name: &str,
        scaling: NodeScaling,
    ) -> CloudResult<String> {
        let mut s = self.state.lock();
        s.call("eks", "UpdateNodegroupConfig")?;
        if !s
            .node_groups
            .contains_key(&(cluster.to_string(), name.to_string()))
        {
            return Err(missing("eks", "UpdateNodegroupConfig", "node group", name));
        }
        if scaling.min_size > scaling.desired_size || scaling.desired_size > scaling.max_size {
            return Err(err(
                CloudErrorKind::InvalidParameter,
                "eks",
                "UpdateNodegroupConfig",
                "desired size must be between min and max",
            ));
        }
        let id = s.id("update");
        s.updates.insert(
            id.clone(),
            SimUpdate {
                cluster: cluster.to_string(),
                effect: UpdateEffect::Scaling(name.to_string(), scaling),
                polls_left: self.polls_to_ready,
                status: UpdateStatus::InProgress,
            },
        );
        Ok(id)
    }

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("eks", "DeleteNodegroup")?;
        let group = s
            .node_groups
            .get_mut(&(cluster.to_string(), name.to_string()))
            .ok_or_else(|| missing("eks", "DeleteNodegroup", "node group", name))?;
        group.progress = Progress::deleting(self.polls_to_ready);
        Ok(())
    }

    async fn describe_update(
        &self,
        cluster: &str,
        _nodegroup: Option<String>,
        update_id: &str,
    ) -> CloudResult<UpdateStatus> {
        let mut s = self.state.lock();
        s.call("eks", "DescribeUpdate")?;
        let update = s
            .updates
            .get_mut(update_id)
            .filter(|u| u.cluster == cluster)
            .ok_or_else(|| missing("eks", "DescribeUpdate", "update", update_id))?;
        if update.status != UpdateStatus::InProgress {
            return Ok(update.status.clone());
        }
        if update.polls_left > 0 {
            update.polls_left -= 1;
            return Ok(UpdateStatus::InProgress);
        }
        update.status = UpdateStatus::Successful;
        let effect = std::mem::replace(&mut update.effect, UpdateEffect::Version(String::new()));

        match effect {
            UpdateEffect::Version(version) => {
                if let Some(c) = s.clusters.get_mut(cluster) {
                    c.description.version = version;
                }
            }
            UpdateEffect::Scaling(group, scaling) => {
                if let Some(g) = s.node_groups.get_mut(&(cluster.to_string(), group)) {
                    g.description.scaling = scaling;
                }
            }
        }
        Ok(UpdateStatus::Successful)
    }

    async fn create_addon(&self, cluster: &str, addon: &str) -> CloudResult<()> {
        let mut s = self.state.lock();
        s.call("eks", "CreateAddon")?;
        if !s.clusters.contains_key(cluster) {
            return Err(missing("eks", "CreateAddon", "cluster", cluster));
        }
        let key = (cluster.to_string(), addon.to_string());
        if s.addons.contains_key(&key) {
            return Err(err(
                CloudErrorKind::AlreadyExists,
                "eks",
                "CreateAddon",
                format!("Addon {} already exists", addon),
            ));
        }
        s.addons
            .insert(key, Progress::provisioning(self.polls_to_ready));
        Ok(())
    }

    async fn describe_addon(&self, cluster: &str, addon: &str) -> CloudResult<ResourceState> {
        let mut s = self.state.lock();
        s.call("eks", "DescribeAddon")?;
        s.addons
            .get_mut(&(cluster.to_string(), addon.to_string()))
            .map(Progress::poll)
            .ok_or_else(|| missing("eks", "DescribeAddon", "addon", addon))
    }
}
