//! Virtual network: VPC, subnets, gateways, route tables and security groups
//!
//! Creation order:
//!
//! ```text
//! VPC -> DNS attributes -> internet gateway -> subnets -> NAT gateways
//!     -> route tables -> security groups
//! ```
//!
//! Deletion runs NAT gateways -> internet gateway -> route tables -> subnets
//! -> security groups -> VPC, every step best-effort.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use strata_common::cidr::Ipv4Cidr;
use strata_common::cluster::ClusterConfig;
use strata_common::config::Timeouts;
use strata_common::lifecycle::ResourceState;
use strata_common::teardown::TeardownReport;
use strata_common::wait::{wait_for_state, WaitPolicy};
use strata_common::{Error, Result};

use crate::api::{CloudErrorKind, CloudResult, Ec2Api, RouteTarget, SecurityRule};
use crate::resources::{
    NatGateway, NetworkingResources, RouteTable, SecurityGroup, SecurityGroupRole, Subnet,
};
use crate::tags::{resource_tags, subnet_tags};

/// Extra prefix bits for each subnet relative to the VPC
pub const SUBNET_PREFIX_BITS: u8 = 4;

/// Block index offset of the first private subnet
pub const PRIVATE_SUBNET_OFFSET: u32 = 8;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";
const KUBE_API_PORT: u16 = 443;
const EPHEMERAL_PORTS: (u16, u16) = (1025, 65535);

/// One planned subnet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetPlan {
    /// Subnet CIDR
    pub cidr: Ipv4Cidr,
    /// Availability zone
    pub availability_zone: String,
    /// Public or private
    pub public: bool,
    /// AZ index
    pub index: usize,
}

/// Carve one public and one private subnet per zone out of `vpc`
///
/// Public subnet `i` takes block `i` and private subnet `i` takes block
/// `PRIVATE_SUBNET_OFFSET + i`, so the two sets never overlap.
pub fn plan_subnets(vpc: Ipv4Cidr, zones: &[String]) -> Result<Vec<SubnetPlan>> {
    if zones.len() > PRIVATE_SUBNET_OFFSET as usize {
        return Err(Error::configuration(format!(
            "at most {} availability zones are supported, got {}",
            PRIVATE_SUBNET_OFFSET,
            zones.len()
        )));
    }
    let prefix = vpc.prefix() + SUBNET_PREFIX_BITS;

    let mut plan = Vec::with_capacity(zones.len() * 2);
    for (i, zone) in zones.iter().enumerate() {
        plan.push(SubnetPlan {
            cidr: vpc.subnet(prefix, i as u32)?,
            availability_zone: zone.clone(),
            public: true,
            index: i,
        });
    }
    for (i, zone) in zones.iter().enumerate() {
        plan.push(SubnetPlan {
            cidr: vpc.subnet(prefix, PRIVATE_SUBNET_OFFSET + i as u32)?,
            availability_zone: zone.clone(),
            public: false,
            index: i,
        });
    }
    Ok(plan)
}

/// NAT gateway for a private subnet: same AZ, else the first one
fn nat_for_zone<'a>(nats: &'a [NatGateway], zone: &str) -> Option<&'a NatGateway> {
    nats.iter()
        .find(|n| n.availability_zone == zone)
        .or_else(|| nats.first())
}

/// Rules tying the two groups together: control plane egress, node ingress
fn cross_group_rules(cp_id: &str, nodes_id: &str) -> (Vec<SecurityRule>, Vec<SecurityRule>) {
    let (low, high) = EPHEMERAL_PORTS;
    let cp_egress = vec![
        SecurityRule::tcp(low, high, nodes_id, "kubelet and extension API servers"),
        SecurityRule::tcp(KUBE_API_PORT, KUBE_API_PORT, nodes_id, "webhooks on 443"),
    ];
    let nodes_ingress = vec![
        SecurityRule::all(nodes_id, "node to node"),
        SecurityRule::tcp(KUBE_API_PORT, KUBE_API_PORT, cp_id, "control plane to API"),
        SecurityRule::tcp(low, high, cp_id, "control plane to kubelet"),
    ];
    (cp_egress, nodes_ingress)
}

/// Creates and removes the network graph of a cluster
pub struct NetworkManager {
    api: Arc<dyn Ec2Api>,
    vpc_wait: WaitPolicy,
    nat_wait: WaitPolicy,
    nat_delete_wait: WaitPolicy,
}

impl NetworkManager {
    /// Create a manager
    pub fn new(api: Arc<dyn Ec2Api>, timeouts: &Timeouts) -> Self {
        Self {
            api,
            vpc_wait: timeouts.vpc,
            nat_wait: timeouts.nat_gateway,
            nat_delete_wait: timeouts.nat_gateway_delete,
        }
    }

    /// Availability zones to use, the first `count` the region offers
    pub async fn select_zones(&self, config: &ClusterConfig) -> Result<Vec<String>> {
        let zones = self.api.describe_availability_zones().await?;
        let count = config.network.az_count as usize;
        if zones.len() < count {
            return Err(Error::configuration_for_field(
                &config.name,
                "network.azCount",
                format!(
                    "{} availability zones requested but {} offers {}",
                    count,
                    config.region,
                    zones.len()
                ),
            ));
        }
        Ok(zones.into_iter().take(count).collect())
    }

    /// Build the full network graph, recording each resource into `out`
    #[instrument(skip(self, config, out), fields(cluster = %config.name))]
    pub async fn create(&self, config: &ClusterConfig, out: &mut NetworkingResources) -> Result<()> {
        let vpc_cidr = config.vpc_cidr()?;
        let zones = self.select_zones(config).await?;
        let plan = plan_subnets(vpc_cidr, &zones)?;
        let api = &self.api;
        let name = &config.name;

        // 1. VPC
        let vpc_id = api
            .create_vpc(&vpc_cidr.to_string(), &resource_tags(config, &format!("{}-vpc", name)))
            .await?;
        out.vpc_id = Some(vpc_id.clone());
        out.vpc_cidr = vpc_cidr.to_string();
        info!(vpc_id = %vpc_id, cidr = %vpc_cidr, "Created VPC");
        wait_for_state(self.vpc_wait, &format!("vpc {}", vpc_id), ResourceState::Active, || {
            self.observe(api.describe_vpc_state(&vpc_id))
        })
        .await?;

        // 2. DNS
        api.enable_vpc_dns(&vpc_id).await?;

        // 3. Internet gateway
        if config.network.enable_internet_gateway {
            let igw_id = api
                .create_internet_gateway(&resource_tags(config, &format!("{}-igw", name)))
                .await?;
            out.internet_gateway_id = Some(igw_id.clone());
            api.attach_internet_gateway(&igw_id, &vpc_id).await?;
            out.internet_gateway_attached = true;
            info!(igw_id = %igw_id, "Attached internet gateway");
        }

        // 4. Subnets
        for subnet in &plan {
            let kind = if subnet.public { "public" } else { "private" };
            let subnet_name = format!("{}-{}-{}", name, kind, subnet.availability_zone);
            let id = api
                .create_subnet(
                    &vpc_id,
                    &subnet.cidr.to_string(),
                    &subnet.availability_zone,
                    &subnet_tags(config, &subnet_name, subnet.public),
                )
                .await?;
            let record = Subnet {
                id: id.clone(),
                cidr: subnet.cidr.to_string(),
                availability_zone: subnet.availability_zone.clone(),
                public: subnet.public,
            };
            if subnet.public {
                out.public_subnets.push(record);
                api.enable_public_ip_on_launch(&id).await?;
            } else {
                out.private_subnets.push(record);
            }
            debug!(subnet_id = %id, cidr = %subnet.cidr, zone = %subnet.availability_zone, kind, "Created subnet");
        }

        // 5. NAT gateways, one per AZ
        if config.network.enable_nat_gateway {
            let public_subnets = out.public_subnets.clone();
            for subnet in &public_subnets {
                self.create_nat(config, subnet, out).await?;
            }
        }

        // 6. Route tables
        self.create_route_tables(config, out).await?;

        // 7. Security groups
        self.create_security_groups(config, out).await?;

        info!(
            vpc_id = %vpc_id,
            public_subnets = out.public_subnets.len(),
            private_subnets = out.private_subnets.len(),
            nat_gateways = out.nat_gateways.len(),
            "Networking ready"
        );
        Ok(())
    }

    async fn observe(
        &self,
        call: impl std::future::Future<Output = CloudResult<ResourceState>>,
    ) -> Result<ResourceState> {
        match call.await {
            Ok(state) => Ok(state),
            Err(e) if e.is(CloudErrorKind::NotFound) => Ok(ResourceState::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_nat(
        &self,
        config: &ClusterConfig,
        subnet: &Subnet,
        out: &mut NetworkingResources,
    ) -> Result<()> {
        let api = &self.api;
        let nat_name = format!("{}-nat-{}", config.name, subnet.availability_zone);
        let tags = resource_tags(config, &nat_name);

        let allocation_id = api.allocate_address(&tags).await?;
        out.unbound_allocation_ids.push(allocation_id.clone());

        let nat_id = api
            .create_nat_gateway(&subnet.id, &allocation_id, &tags)
            .await?;
        out.unbound_allocation_ids.retain(|a| a != &allocation_id);
        out.nat_gateways.push(NatGateway {
            id: nat_id.clone(),
            allocation_id,
            subnet_id: subnet.id.clone(),
            availability_zone: subnet.availability_zone.clone(),
        });
        info!(nat_id = %nat_id, zone = %subnet.availability_zone, "Created NAT gateway, waiting");

        wait_for_state(
            self.nat_wait,
            &format!("nat gateway {}", nat_id),
            ResourceState::Active,
            || self.observe(api.describe_nat_gateway_state(&nat_id)),
        )
        .await
    }

    async fn create_route_tables(
        &self,
        config: &ClusterConfig,
        out: &mut NetworkingResources,
    ) -> Result<()> {
        let api = &self.api;
        let vpc_id = out
            .vpc_id
            .clone()
            .ok_or_else(|| Error::internal("network", "route tables need a VPC"))?;

        // Shared public table
        let public_id = api
            .create_route_table(&vpc_id, &resource_tags(config, &format!("{}-public", config.name)))
            .await?;
        out.route_tables.push(RouteTable {
            id: public_id.clone(),
            public: true,
            subnet_ids: Vec::new(),
            association_ids: Vec::new(),
        });
        let public_idx = out.route_tables.len() - 1;
        if let Some(igw_id) = &out.internet_gateway_id {
            api.create_route(
                &public_id,
                DEFAULT_ROUTE,
                &RouteTarget::InternetGateway(igw_id.clone()),
            )
            .await?;
        }
        for subnet in out.public_subnets.clone() {
            let association = api.associate_route_table(&public_id, &subnet.id).await?;
            let table = &mut out.route_tables[public_idx];
            table.subnet_ids.push(subnet.id);
            table.association_ids.push(association);
        }

        // One private table per private subnet
        for subnet in out.private_subnets.clone() {
            let table_name = format!("{}-private-{}", config.name, subnet.availability_zone);
            let table_id = api
                .create_route_table(&vpc_id, &resource_tags(config, &table_name))
                .await?;
            out.route_tables.push(RouteTable {
                id: table_id.clone(),
                public: false,
                subnet_ids: Vec::new(),
                association_ids: Vec::new(),
            });
            let idx = out.route_tables.len() - 1;

            match nat_for_zone(&out.nat_gateways, &subnet.availability_zone) {
                Some(nat) => {
                    if nat.availability_zone != subnet.availability_zone {
                        warn!(
                            subnet_id = %subnet.id,
                            nat_id = %nat.id,
                            "No NAT gateway in subnet's zone, routing through another zone"
                        );
                    }
                    api.create_route(
                        &table_id,
                        DEFAULT_ROUTE,
                        &RouteTarget::NatGateway(nat.id.clone()),
                    )
                    .await?;
                }
                None => debug!(subnet_id = %subnet.id, "No NAT gateway, private subnet has no egress"),
            }

            let association = api.associate_route_table(&table_id, &subnet.id).await?;
            let table = &mut out.route_tables[idx];
            table.subnet_ids.push(subnet.id);
            table.association_ids.push(association);
        }
        Ok(())
    }

    async fn create_security_groups(
        &self,
        config: &ClusterConfig,
        out: &mut NetworkingResources,
    ) -> Result<()> {
        let api = &self.api;
        let vpc_id = out
            .vpc_id
            .clone()
            .ok_or_else(|| Error::internal("network", "security groups need a VPC"))?;

        let cp_name = format!("{}-control-plane-sg", config.name);
        let cp_description = format!("Control plane of {}", config.name);
        let cp_id = api
            .create_security_group(&vpc_id, &cp_name, &cp_description, &resource_tags(config, &cp_name))
            .await?;
        out.security_groups.push(SecurityGroup {
            id: cp_id.clone(),
            name: cp_name,
            description: cp_description,
            role: SecurityGroupRole::ControlPlane,
        });

        let nodes_name = format!("{}-nodes-sg", config.name);
        let nodes_description = format!("Worker nodes of {}", config.name);
        let nodes_id = api
            .create_security_group(
                &vpc_id,
                &nodes_name,
                &nodes_description,
                &resource_tags(config, &nodes_name),
            )
            .await?;
        out.security_groups.push(SecurityGroup {
            id: nodes_id.clone(),
            name: nodes_name,
            description: nodes_description,
            role: SecurityGroupRole::Nodes,
        });

        let (cp_egress, nodes_ingress) = cross_group_rules(&cp_id, &nodes_id);
        api.authorize_egress(&cp_id, &cp_egress).await?;
        api.authorize_ingress(&nodes_id, &nodes_ingress).await?;
        debug!(control_plane_sg = %cp_id, nodes_sg = %nodes_id, "Created security groups");
        Ok(())
    }

    /// Tear down a network graph; every step is attempted
    #[instrument(skip(self, resources), fields(vpc_id = ?resources.vpc_id))]
    pub async fn delete(&self, resources: &NetworkingResources) -> TeardownReport {
        let mut report = TeardownReport::new();
        let api = &self.api;

        // NAT gateways, then their addresses once the gateway is gone
        for nat in &resources.nat_gateways {
            let deleted = self.delete_nat(&nat.id).await;
            let released = deleted.is_ok();
            report.record("nat-gateway", nat.id.as_str(), deleted);
            if released {
                let result = api.release_address(&nat.allocation_id).await.map_err(Error::from);
                report.record("elastic-ip", nat.allocation_id.as_str(), result);
            } else {
                report.failed(
                    "elastic-ip",
                    nat.allocation_id.as_str(),
                    "still associated with an undeleted NAT gateway",
                );
            }
        }
        for allocation in &resources.unbound_allocation_ids {
            let result = api.release_address(allocation).await.map_err(Error::from);
            report.record("elastic-ip", allocation.as_str(), result);
        }

        // Internet gateway
        if let Some(igw_id) = &resources.internet_gateway_id {
            if let (true, Some(vpc_id)) = (resources.internet_gateway_attached, &resources.vpc_id) {
                let result = api
                    .detach_internet_gateway(igw_id, vpc_id)
                    .await
                    .map_err(Error::from);
                report.record("internet-gateway-attachment", igw_id.as_str(), result);
            }
            let result = api.delete_internet_gateway(igw_id).await.map_err(Error::from);
            report.record("internet-gateway", igw_id.as_str(), result);
        }

        // Route tables
        for table in &resources.route_tables {
            for association in &table.association_ids {
                let result = api
                    .disassociate_route_table(association)
                    .await
                    .map_err(Error::from);
                report.record("route-table-association", association.as_str(), result);
            }
            let result = api.delete_route_table(&table.id).await.map_err(Error::from);
            report.record("route-table", table.id.as_str(), result);
        }

        // Subnets
        for subnet in resources.public_subnets.iter().chain(&resources.private_subnets) {
            let result = api.delete_subnet(&subnet.id).await.map_err(Error::from);
            report.record("subnet", subnet.id.as_str(), result);
        }

        // Cross-group rules, since EC2 will not delete a group another group's
        // rules still reference
        if let (Some(cp), Some(nodes)) = (
            resources.security_group(SecurityGroupRole::ControlPlane),
            resources.security_group(SecurityGroupRole::Nodes),
        ) {
            let (cp_egress, nodes_ingress) = cross_group_rules(&cp.id, &nodes.id);
            let result = api.revoke_egress(&cp.id, &cp_egress).await.map_err(Error::from);
            report.record("security-group-rule", format!("{}/egress", cp.id), result);
            let result = api
                .revoke_ingress(&nodes.id, &nodes_ingress)
                .await
                .map_err(Error::from);
            report.record("security-group-rule", format!("{}/ingress", nodes.id), result);
        }

        // Security groups, in reverse creation order
        for group in resources.security_groups.iter().rev() {
            let result = api
                .delete_security_group(&group.id)
                .await
                .map_err(Error::from);
            report.record("security-group", group.id.as_str(), result);
        }

        // VPC last
        if let Some(vpc_id) = &resources.vpc_id {
            let result = api.delete_vpc(vpc_id).await.map_err(Error::from);
            report.record("vpc", vpc_id.as_str(), result);
        }

        if report.is_clean() {
            info!("Networking deleted");
        }
        report
    }

    async fn delete_nat(&self, nat_id: &str) -> Result<()> {
        let api = &self.api;
        api.delete_nat_gateway(nat_id).await?;
        wait_for_state(
            self.nat_delete_wait,
            &format!("nat gateway {} deletion", nat_id),
            ResourceState::Absent,
            || self.observe(api.describe_nat_gateway_state(nat_id)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn zones(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("us-east-1{}", (b'a' + i as u8) as char)).collect()
    }

    #[test]
    fn plans_public_and_private_blocks_for_default_vpc() {
        let vpc: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let plan = plan_subnets(vpc, &zones(2)).unwrap();

        let cidrs: Vec<_> = plan.iter().map(|p| (p.cidr.to_string(), p.public)).collect();
        assert_eq!(
            cidrs,
            vec![
                ("10.0.0.0/20".to_string(), true),
                ("10.0.16.0/20".to_string(), true),
                ("10.0.128.0/20".to_string(), false),
                ("10.0.144.0/20".to_string(), false),
            ]
        );
        assert_eq!(plan[2].availability_zone, "us-east-1a");
    }

    #[rstest]
    fn subnet_sets_never_overlap(
        #[values("10.0.0.0/16", "172.16.0.0/18", "192.168.0.0/20", "10.20.30.0/24")] vpc: &str,
        #[values(1, 2, 3, 4, 5, 6)] az_count: usize,
    ) {
        let vpc: Ipv4Cidr = vpc.parse().unwrap();
        let plan = plan_subnets(vpc, &zones(az_count)).unwrap();
        assert_eq!(plan.len(), az_count * 2);

        for (i, a) in plan.iter().enumerate() {
            assert!(vpc.contains(&a.cidr), "{} outside {}", a.cidr, vpc);
            for b in plan.iter().skip(i + 1) {
                assert!(!a.cidr.overlaps(&b.cidr), "{} overlaps {}", a.cidr, b.cidr);
            }
        }
    }

    #[test]
    fn too_many_zones_is_rejected() {
        let vpc: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        assert!(plan_subnets(vpc, &zones(9)).is_err());
    }

    #[test]
    fn private_subnet_prefers_nat_in_same_zone() {
        let nats = vec![
            NatGateway {
                id: "nat-a".into(),
                allocation_id: "eip-a".into(),
                subnet_id: "subnet-a".into(),
                availability_zone: "us-east-1a".into(),
            },
            NatGateway {
                id: "nat-b".into(),
                allocation_id: "eip-b".into(),
                subnet_id: "subnet-b".into(),
                availability_zone: "us-east-1b".into(),
            },
        ];
        assert_eq!(nat_for_zone(&nats, "us-east-1b").unwrap().id, "nat-b");
        assert_eq!(nat_for_zone(&nats, "us-east-1c").unwrap().id, "nat-a");
        assert!(nat_for_zone(&[], "us-east-1a").is_none());
    }

    mod simulated {
        use super::*;
        use crate::api::RulePeer;
        use crate::sim::SimulatedCloud;
        use strata_common::teardown::TeardownOutcome;
        use strata_common::ErrorKind;

        fn manager(cloud: &Arc<SimulatedCloud>) -> NetworkManager {
            NetworkManager::new(cloud.clone(), &Timeouts::immediate())
        }

        fn grouped(calls: &[String], prefix: &str, skip: &[&str]) -> Vec<String> {
            let mut out: Vec<String> = Vec::new();
            for call in calls.iter().filter(|c| c.starts_with(prefix)) {
                if skip.contains(&call.as_str()) {
                    continue;
                }
                if out.last() != Some(call) {
                    out.push(call.clone());
                }
            }
            out
        }

        #[tokio::test]
        async fn teardown_mirrors_creation_order() {
            let cloud = Arc::new(SimulatedCloud::new());
            let network = manager(&cloud);
            let mut resources = NetworkingResources::default();
            network
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .unwrap();

            let created = grouped(&cloud.calls(), "ec2:Create", &["ec2:CreateRoute"]);
            assert_eq!(
                created,
                vec![
                    "ec2:CreateVpc",
                    "ec2:CreateInternetGateway",
                    "ec2:CreateSubnet",
                    "ec2:CreateNatGateway",
                    "ec2:CreateRouteTable",
                    "ec2:CreateSecurityGroup",
                ]
            );

            cloud.clear_calls();
            let report = network.delete(&resources).await;
            assert!(report.is_clean(), "{:?}", report);

            let deleted = grouped(&cloud.calls(), "ec2:Delete", &[]);
            assert_eq!(
                deleted,
                vec![
                    "ec2:DeleteNatGateway",
                    "ec2:DeleteInternetGateway",
                    "ec2:DeleteRouteTable",
                    "ec2:DeleteSubnet",
                    "ec2:DeleteSecurityGroup",
                    "ec2:DeleteVpc",
                ]
            );
            assert_eq!(cloud.live_resource_count(), 0);
        }

        #[tokio::test]
        async fn cross_group_rules_are_revoked_before_groups_are_deleted() {
            let cloud = Arc::new(SimulatedCloud::new());
            let network = manager(&cloud);
            let mut resources = NetworkingResources::default();
            network
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .unwrap();
            let cp = resources.security_group(SecurityGroupRole::ControlPlane).unwrap();
            let nodes = resources.security_group(SecurityGroupRole::Nodes).unwrap();

            // Without the revokes neither group can go
            for group in [&cp.id, &nodes.id] {
                let e = cloud.delete_security_group(group).await.unwrap_err();
                assert!(e.is(CloudErrorKind::DependencyViolation));
            }

            cloud.clear_calls();
            let report = network.delete(&resources).await;
            assert!(report.is_clean(), "{:?}", report);

            let calls = cloud.calls();
            let position = |op: &str| calls.iter().position(|c| c == op).unwrap();
            let first_delete = position("ec2:DeleteSecurityGroup");
            assert!(position("ec2:RevokeSecurityGroupEgress") < first_delete);
            assert!(position("ec2:RevokeSecurityGroupIngress") < first_delete);
            assert_eq!(
                report
                    .entries
                    .iter()
                    .filter(|e| e.resource == "security-group-rule")
                    .count(),
                2
            );
            assert_eq!(cloud.live_resource_count(), 0);
        }

        #[tokio::test]
        async fn private_tables_route_through_zone_local_nat() {
            let cloud = Arc::new(SimulatedCloud::new());
            let mut resources = NetworkingResources::default();
            let mut config = ClusterConfig::new("t1", "us-east-1");
            config.network.az_count = 3;
            manager(&cloud).create(&config, &mut resources).await.unwrap();

            assert_eq!(resources.nat_gateways.len(), 3);
            assert_eq!(resources.route_tables.len(), 4);
            assert!(resources.unbound_allocation_ids.is_empty());

            let public = &resources.route_tables[0];
            assert!(public.public);
            assert_eq!(public.subnet_ids.len(), 3);

            for table in resources.route_tables.iter().filter(|t| !t.public) {
                let subnet = resources
                    .private_subnets
                    .iter()
                    .find(|s| s.id == table.subnet_ids[0])
                    .unwrap();
                let nat = resources
                    .nat_gateways
                    .iter()
                    .find(|n| n.availability_zone == subnet.availability_zone)
                    .unwrap();
                assert_eq!(
                    cloud.routes(&table.id),
                    vec![RouteTarget::NatGateway(nat.id.clone())]
                );
            }
        }

        #[tokio::test]
        async fn node_group_accepts_api_and_kubelet_from_control_plane() {
            let cloud = Arc::new(SimulatedCloud::new());
            let mut resources = NetworkingResources::default();
            manager(&cloud)
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .unwrap();

            let cp = resources.security_group(SecurityGroupRole::ControlPlane).unwrap();
            let nodes = resources.security_group(SecurityGroupRole::Nodes).unwrap();
            assert_eq!(cp.name, "t1-control-plane-sg");
            assert_eq!(nodes.name, "t1-nodes-sg");

            let (ingress, _) = cloud.security_group_rules(&nodes.id);
            let from_cp: Vec<_> = ingress
                .iter()
                .filter(|r| r.peer == RulePeer::SecurityGroup(cp.id.clone()))
                .collect();
            assert!(from_cp.iter().any(|r| r.from_port == 443 && r.to_port == 443));
            assert!(from_cp
                .iter()
                .any(|r| r.from_port <= 10250 && r.to_port >= 10250));
            assert!(ingress
                .iter()
                .any(|r| r.protocol == "-1" && r.peer == RulePeer::SecurityGroup(nodes.id.clone())));

            let (_, egress) = cloud.security_group_rules(&cp.id);
            assert!(egress
                .iter()
                .all(|r| r.peer == RulePeer::SecurityGroup(nodes.id.clone())));
        }

        #[tokio::test]
        async fn too_few_zones_fails_before_any_resource() {
            let cloud = Arc::new(SimulatedCloud::new().with_zones(["us-east-1a"]));
            let mut resources = NetworkingResources::default();
            let err = manager(&cloud)
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert_eq!(cloud.call_count("ec2:CreateVpc"), 0);
        }

        #[tokio::test]
        async fn failed_nat_keeps_address_for_teardown() {
            let cloud = Arc::new(SimulatedCloud::new());
            cloud.fail_next("ec2:CreateNatGateway", CloudErrorKind::LimitExceeded);
            let network = manager(&cloud);
            let mut resources = NetworkingResources::default();
            assert!(network
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .is_err());
            assert_eq!(resources.unbound_allocation_ids.len(), 1);

            let report = network.delete(&resources).await;
            assert!(report.is_clean(), "{:?}", report);
            assert_eq!(cloud.live_resource_count(), 0);
        }

        #[tokio::test]
        async fn teardown_continues_past_failures() {
            let cloud = Arc::new(SimulatedCloud::new());
            let network = manager(&cloud);
            let mut resources = NetworkingResources::default();
            network
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .unwrap();

            cloud.fail_next("ec2:DeleteInternetGateway", CloudErrorKind::AccessDenied);
            let report = network.delete(&resources).await;

            let failed: Vec<_> = report.failures().map(|e| e.resource.as_str()).collect();
            assert_eq!(failed, vec!["internet-gateway"]);
            assert_eq!(cloud.live_resource_count(), 1);
            assert!(report
                .entries
                .iter()
                .filter(|e| e.resource == "subnet")
                .all(|e| e.outcome == TeardownOutcome::Deleted));
        }

        #[tokio::test]
        async fn second_teardown_reports_everything_absent() {
            let cloud = Arc::new(SimulatedCloud::new());
            let network = manager(&cloud);
            let mut resources = NetworkingResources::default();
            network
                .create(&ClusterConfig::new("t1", "us-east-1"), &mut resources)
                .await
                .unwrap();
            assert!(network.delete(&resources).await.is_clean());

            let again = network.delete(&resources).await;
            assert!(again.failures().next().is_none());
            assert!(again
                .entries
                .iter()
                .filter(|e| e.resource != "nat-gateway" && e.resource != "elastic-ip")
                .all(|e| e.outcome == TeardownOutcome::AlreadyAbsent));
        }
    }
}
