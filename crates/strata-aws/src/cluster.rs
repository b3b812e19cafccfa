//! Managed control plane, node group and add-ons

use std::sync::Arc;

use tracing::{info, instrument, warn};

use strata_common::cluster::ClusterConfig;
use strata_common::config::Timeouts;
use strata_common::kubeconfig::{ExecEnvVar, ExecPlugin, Kubeconfig, KubeconfigSpec, EXEC_API_VERSION};
use strata_common::lifecycle::ResourceState;
use strata_common::provider::NodeScaling;
use strata_common::state::{ClusterPhase, ClusterStatus};
use strata_common::teardown::TeardownReport;
use strata_common::wait::{wait_until, WaitPolicy};
use strata_common::{Error, Result};

use crate::api::{
    ensure, CloudErrorKind, ControlPlaneDescription, ControlPlaneRequest, EksApi,
    NodeGroupDescription, NodeGroupRequest, UpdateStatus,
};
use crate::resources::{
    ClusterResources, ControlPlane, IamResources, NetworkingResources, NodeGroup,
    SecurityGroupRole,
};
use crate::tags::{node_group_name, resource_tags};

/// Control plane log categories enabled on every cluster
pub const CONTROL_PLANE_LOG_TYPES: &[&str] = &[
    "api",
    "audit",
    "authenticator",
    "controllerManager",
    "scheduler",
];

/// Managed add-on providing the EBS CSI driver
pub const EBS_CSI_ADDON: &str = "aws-ebs-csi-driver";
/// Managed add-on providing pod identity credentials
pub const POD_IDENTITY_ADDON: &str = "eks-pod-identity-agent";

impl From<ControlPlaneDescription> for ControlPlane {
    fn from(d: ControlPlaneDescription) -> Self {
        Self {
            name: d.name,
            arn: d.arn,
            version: d.version,
            endpoint: d.endpoint,
            certificate_authority_data: d.certificate_authority_data,
            status: d.status,
            created_at: d.created_at,
        }
    }
}

impl From<NodeGroupDescription> for NodeGroup {
    fn from(d: NodeGroupDescription) -> Self {
        Self {
            name: d.name,
            arn: d.arn,
            status: d.status,
            instance_types: d.instance_types,
            scaling: d.scaling,
            created_at: d.created_at,
        }
    }
}

/// Kubeconfig for a control plane, authenticating through `aws eks get-token`
///
/// Pure transformation; makes no API calls.
pub fn generate_kubeconfig(control_plane: &ControlPlane, region: &str) -> Result<Kubeconfig> {
    let endpoint = control_plane
        .endpoint
        .clone()
        .ok_or_else(|| Error::not_found("control plane endpoint", &control_plane.name))?;
    let ca = control_plane
        .certificate_authority_data
        .clone()
        .ok_or_else(|| Error::not_found("certificate authority data", &control_plane.name))?;

    Kubeconfig::generate(&KubeconfigSpec {
        entry_name: control_plane.arn.clone(),
        server: endpoint,
        certificate_authority_data: ca,
        exec: ExecPlugin {
            api_version: EXEC_API_VERSION.to_string(),
            command: "aws".to_string(),
            args: vec![
                "--region".to_string(),
                region.to_string(),
                "eks".to_string(),
                "get-token".to_string(),
                "--cluster-name".to_string(),
                control_plane.name.clone(),
                "--output".to_string(),
                "json".to_string(),
            ],
            env: vec![ExecEnvVar {
                name: "AWS_STS_REGIONAL_ENDPOINTS".to_string(),
                value: "regional".to_string(),
            }],
            interactive_mode: "IfAvailable".to_string(),
        },
    })
}

/// Creates, updates and removes the control plane and node group
pub struct ClusterManager {
    api: Arc<dyn EksApi>,
    timeouts: Timeouts,
}

impl ClusterManager {
    /// Create a manager
    pub fn new(api: Arc<dyn EksApi>, timeouts: &Timeouts) -> Self {
        Self {
            api,
            timeouts: timeouts.clone(),
        }
    }

    /// Create the control plane, then the node group, then enabled add-ons
    #[instrument(skip_all, fields(cluster = %config.name))]
    pub async fn create(
        &self,
        config: &ClusterConfig,
        networking: &NetworkingResources,
        iam: &IamResources,
        out: &mut ClusterResources,
    ) -> Result<()> {
        let name = &config.name;
        let cluster_role = iam
            .cluster_role
            .as_ref()
            .ok_or_else(|| Error::internal("cluster", "control plane needs the cluster role"))?;
        let node_role = iam
            .node_role
            .as_ref()
            .ok_or_else(|| Error::internal("cluster", "node group needs the node role"))?;
        let control_plane_sg = networking
            .security_group(SecurityGroupRole::ControlPlane)
            .ok_or_else(|| Error::internal("cluster", "control plane needs its security group"))?;
        if networking.private_subnets.is_empty() {
            return Err(Error::configuration_for_field(
                name,
                "network",
                "node group needs at least one private subnet",
            ));
        }

        // Control plane
        let request = ControlPlaneRequest {
            name: name.clone(),
            version: config.kubernetes_version.clone(),
            role_arn: cluster_role.arn.clone(),
            subnet_ids: networking.all_subnet_ids(),
            security_group_ids: vec![control_plane_sg.id.clone()],
            log_types: CONTROL_PLANE_LOG_TYPES.iter().map(|s| s.to_string()).collect(),
            tags: resource_tags(config, name),
        };
        let api = &self.api;
        let created = ensure(api.create_cluster(&request).await, || api.describe_cluster(name)).await?;
        if !created.was_created() {
            warn!("Control plane already exists, adopting it");
        }
        out.control_plane = Some(created.into_inner().into());
        info!(version = %config.kubernetes_version, "Created control plane, waiting for it to become active");

        let active = self.wait_control_plane_active(name).await?;
        out.control_plane = Some(active.into());
        info!("Control plane active");

        // Node group
        let ng_name = node_group_name(name);
        let request = NodeGroupRequest {
            cluster: name.clone(),
            name: ng_name.clone(),
            node_role_arn: node_role.arn.clone(),
            subnet_ids: networking.private_subnets.iter().map(|s| s.id.clone()).collect(),
            instance_types: vec![config.node.instance_type.clone()],
            disk_size_gb: config.node.disk_size_gb,
            scaling: NodeScaling::new(
                config.node.min_size,
                config.node.max_size,
                config.node.desired_size,
            ),
            labels: config.node.labels.clone(),
            tags: resource_tags(config, &ng_name),
        };
        let created = ensure(api.create_nodegroup(&request).await, || {
            api.describe_nodegroup(name, &ng_name)
        })
        .await?;
        out.node_groups.push(created.into_inner().into());
        info!(node_group = %ng_name, "Created node group, waiting for it to become active");

        let active = self.wait_node_group_active(name, &ng_name).await?;
        if let Some(record) = out.node_groups.iter_mut().find(|g| g.name == ng_name) {
            *record = active.into();
        }
        info!(node_group = %ng_name, "Node group active");

        // Add-ons
        for addon in enabled_addons(config) {
            self.install_addon(name, addon).await?;
            out.addons.push(addon.to_string());
        }
        Ok(())
    }

    async fn wait_control_plane_active(&self, name: &str) -> Result<ControlPlaneDescription> {
        let api = &self.api;
        wait_until(
            self.timeouts.control_plane,
            &format!("control plane {}", name),
            || async move {
                let d = api.describe_cluster(name).await?;
                ready_or_failed(&d.status, &format!("control plane {}", name)).map(|ready| ready.then_some(d))
            },
        )
        .await
    }

    async fn wait_node_group_active(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<NodeGroupDescription> {
        self.wait_node_group(self.timeouts.node_group, cluster, name).await
    }

    async fn wait_node_group(
        &self,
        policy: WaitPolicy,
        cluster: &str,
        name: &str,
    ) -> Result<NodeGroupDescription> {
        let api = &self.api;
        wait_until(policy, &format!("node group {}", name), || async move {
            let d = api.describe_nodegroup(cluster, name).await?;
            ready_or_failed(&d.status, &format!("node group {}", name)).map(|ready| ready.then_some(d))
        })
        .await
    }

    async fn install_addon(&self, cluster: &str, addon: &str) -> Result<()> {
        let api = &self.api;
        match api.create_addon(cluster, addon).await {
            Ok(()) => info!(addon = %addon, "Installing add-on"),
            Err(e) if e.is(CloudErrorKind::AlreadyExists) => {
                info!(addon = %addon, "Add-on already installed")
            }
            Err(e) => return Err(e.into()),
        }
        wait_until(
            self.timeouts.node_group,
            &format!("add-on {}", addon),
            || async move {
                let state = api.describe_addon(cluster, addon).await?;
                ready_or_failed(&state, &format!("add-on {}", addon)).map(|ready| ready.then_some(()))
            },
        )
        .await
    }

    /// Delete node groups (waiting for each), then the control plane
    #[instrument(skip_all)]
    pub async fn delete(&self, resources: &ClusterResources) -> TeardownReport {
        let mut report = TeardownReport::new();
        let Some(cluster) = resources
            .control_plane
            .as_ref()
            .map(|cp| cp.name.clone())
        else {
            return report;
        };

        for group in &resources.node_groups {
            let result = self.delete_node_group(&cluster, &group.name).await;
            report.record("node-group", group.name.as_str(), result);
        }

        let result = self.delete_control_plane(&cluster).await;
        report.record("control-plane", cluster.as_str(), result);
        report
    }

    async fn delete_node_group(&self, cluster: &str, name: &str) -> Result<()> {
        let api = &self.api;
        api.delete_nodegroup(cluster, name).await?;
        info!(node_group = %name, "Deleting node group");
        wait_until(
            self.timeouts.node_group_delete,
            &format!("node group {} deletion", name),
            || async move { gone(api.describe_nodegroup(cluster, name).await.map(|d| d.status)) },
        )
        .await
    }

    async fn delete_control_plane(&self, name: &str) -> Result<()> {
        let api = &self.api;
        api.delete_cluster(name).await?;
        info!(cluster = %name, "Deleting control plane");
        wait_until(
            self.timeouts.control_plane_delete,
            &format!("control plane {} deletion", name),
            || async move { gone(api.describe_cluster(name).await.map(|d| d.status)) },
        )
        .await
    }

    /// Change node group bounds and wait for the update to finish
    #[instrument(skip(self, resources))]
    pub async fn update_node_group(
        &self,
        resources: &mut ClusterResources,
        scaling: NodeScaling,
    ) -> Result<()> {
        let cluster = control_plane_name(resources)?;
        let group = resources
            .node_groups
            .first()
            .map(|g| g.name.clone())
            .ok_or_else(|| Error::not_found("node group", &cluster))?;

        let update_id = self
            .api
            .update_nodegroup_config(&cluster, &group, scaling)
            .await?;
        info!(node_group = %group, update_id = %update_id, "Scaling node group");
        self.wait_update(&cluster, Some(group.clone()), &update_id).await?;

        let refreshed = self.api.describe_nodegroup(&cluster, &group).await?;
        if let Some(record) = resources.node_groups.iter_mut().find(|g| g.name == group) {
            *record = refreshed.into();
        }
        Ok(())
    }

    /// Upgrade the control plane and wait for the update to finish
    #[instrument(skip(self, resources))]
    pub async fn update_cluster_version(
        &self,
        resources: &mut ClusterResources,
        version: &str,
    ) -> Result<()> {
        let cluster = control_plane_name(resources)?;
        let update_id = self.api.update_cluster_version(&cluster, version).await?;
        info!(update_id = %update_id, version = %version, "Upgrading control plane");
        self.wait_update(&cluster, None, &update_id).await?;

        let refreshed = self.api.describe_cluster(&cluster).await?;
        resources.control_plane = Some(refreshed.into());
        Ok(())
    }

    async fn wait_update(
        &self,
        cluster: &str,
        nodegroup: Option<String>,
        update_id: &str,
    ) -> Result<()> {
        let api = &self.api;
        let nodegroup = &nodegroup;
        wait_until(self.timeouts.update, &format!("update {}", update_id), || async move {
            match api.describe_update(cluster, nodegroup.clone(), update_id).await? {
                UpdateStatus::Successful => Ok(Some(())),
                UpdateStatus::InProgress => Ok(None),
                UpdateStatus::Failed(reason) => Err(Error::provider_fatal(
                    "aws/eks",
                    "DescribeUpdate",
                    format!("update {} failed: {}", update_id, reason),
                )),
                UpdateStatus::Cancelled => Err(Error::provider_fatal(
                    "aws/eks",
                    "DescribeUpdate",
                    format!("update {} was cancelled", update_id),
                )),
            }
        })
        .await
    }

    /// Live status of the control plane and node groups
    pub async fn describe_status(&self, resources: &ClusterResources) -> Result<ClusterStatus> {
        let cluster = control_plane_name(resources)?;
        let control_plane = self.api.describe_cluster(&cluster).await?;

        let mut nodes_total = 0;
        let mut nodes_ready = 0;
        let mut groups_active = true;
        for group in &resources.node_groups {
            let d = self.api.describe_nodegroup(&cluster, &group.name).await?;
            nodes_total += d.scaling.desired_size;
            if d.status == ResourceState::Active {
                nodes_ready += d.scaling.desired_size;
            } else {
                groups_active = false;
            }
        }

        let (phase, message) = match &control_plane.status {
            ResourceState::Active if groups_active => (ClusterPhase::Active, "cluster ready".to_string()),
            ResourceState::Active => (ClusterPhase::Updating, "node groups not ready".to_string()),
            ResourceState::Requested | ResourceState::Provisioning => {
                (ClusterPhase::Creating, "control plane provisioning".to_string())
            }
            ResourceState::Deleting | ResourceState::Absent => {
                (ClusterPhase::Deleting, "control plane deleting".to_string())
            }
            ResourceState::Failed(reason) => (ClusterPhase::Failed, reason.clone()),
        };

        let mut status = ClusterStatus::new(phase, message);
        status.ready = phase == ClusterPhase::Active;
        status.endpoint = control_plane.endpoint;
        status.nodes_ready = nodes_ready;
        status.nodes_total = nodes_total;
        Ok(status)
    }
}

fn enabled_addons(config: &ClusterConfig) -> Vec<&'static str> {
    let mut addons = Vec::new();
    if config.addons.ebs_csi_driver {
        addons.push(EBS_CSI_ADDON);
    }
    if config.addons.pod_identity_agent {
        addons.push(POD_IDENTITY_ADDON);
    }
    addons
}

fn control_plane_name(resources: &ClusterResources) -> Result<String> {
    resources
        .control_plane
        .as_ref()
        .map(|cp| cp.name.clone())
        .ok_or_else(|| Error::not_found("control plane", "resource graph"))
}

/// `Ok(true)` when active, `Ok(false)` while still converging, `Err` on failure
fn ready_or_failed(state: &ResourceState, what: &str) -> Result<bool> {
    match state {
        ResourceState::Active => Ok(true),
        ResourceState::Failed(reason) => Err(Error::provider_fatal(
            "aws/eks",
            "wait",
            format!("{} failed: {}", what, reason),
        )),
        ResourceState::Absent => Err(Error::provider_fatal(
            "aws/eks",
            "wait",
            format!("{} disappeared", what),
        )),
        _ => Ok(false),
    }
}

/// Poll result for a deletion wait: done once the resource is absent
fn gone(described: crate::api::CloudResult<ResourceState>) -> Result<Option<()>> {
    match described {
        Err(e) if e.is(CloudErrorKind::NotFound) => Ok(Some(())),
        Err(e) => Err(e.into()),
        Ok(ResourceState::Absent) => Ok(Some(())),
        Ok(ResourceState::Failed(reason)) => Err(Error::provider_fatal(
            "aws/eks",
            "delete",
            format!("deletion failed: {}", reason),
        )),
        Ok(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CloudError, MockEksApi, Role};
    use crate::resources::{SecurityGroup, Subnet};
    use base64::Engine;
    use chrono::Utc;
    use strata_common::ErrorKind;

    fn control_plane(status: ResourceState) -> ControlPlane {
        ControlPlane {
            name: "t1".into(),
            arn: "arn:aws:eks:us-east-1:123456789012:cluster/t1".into(),
            version: "1.29".into(),
            endpoint: Some("https://ABCD.gr7.us-east-1.eks.amazonaws.com".into()),
            certificate_authority_data: Some(
                base64::engine::general_purpose::STANDARD.encode("ca"),
            ),
            status,
            created_at: Utc::now(),
        }
    }

    fn describe_cp(status: ResourceState) -> ControlPlaneDescription {
        let cp = control_plane(status);
        ControlPlaneDescription {
            name: cp.name,
            arn: cp.arn,
            version: cp.version,
            endpoint: cp.endpoint,
            certificate_authority_data: cp.certificate_authority_data,
            status: cp.status,
            created_at: cp.created_at,
        }
    }

    fn describe_ng(status: ResourceState, desired: u32) -> NodeGroupDescription {
        NodeGroupDescription {
            name: "t1-nodes".into(),
            arn: "arn:nodegroup".into(),
            status,
            instance_types: vec!["t3.medium".into()],
            scaling: NodeScaling::new(1, 3, desired),
            version: "1.29".into(),
            created_at: Utc::now(),
        }
    }

    fn not_found(op: &str) -> CloudError {
        CloudError::new(CloudErrorKind::NotFound, "eks", op, "ResourceNotFoundException")
    }

    fn manager(api: MockEksApi) -> ClusterManager {
        ClusterManager::new(Arc::new(api), &Timeouts::immediate())
    }

    fn inputs() -> (NetworkingResources, IamResources) {
        let networking = NetworkingResources {
            vpc_id: Some("vpc-1".into()),
            private_subnets: vec![Subnet {
                id: "subnet-priv".into(),
                cidr: "10.0.128.0/20".into(),
                availability_zone: "us-east-1a".into(),
                public: false,
            }],
            public_subnets: vec![Subnet {
                id: "subnet-pub".into(),
                cidr: "10.0.0.0/20".into(),
                availability_zone: "us-east-1a".into(),
                public: true,
            }],
            security_groups: vec![SecurityGroup {
                id: "sg-cp".into(),
                name: "t1-control-plane-sg".into(),
                description: String::new(),
                role: SecurityGroupRole::ControlPlane,
            }],
            ..Default::default()
        };
        let iam = IamResources {
            cluster_role: Some(Role {
                name: "t1-cluster-role".into(),
                arn: "arn:cluster-role".into(),
            }),
            node_role: Some(Role {
                name: "t1-node-role".into(),
                arn: "arn:node-role".into(),
            }),
            ..Default::default()
        };
        (networking, iam)
    }

    #[tokio::test]
    async fn create_waits_for_control_plane_then_node_group() {
        let mut api = MockEksApi::new();
        api.expect_create_cluster().returning(|req| {
            assert_eq!(req.subnet_ids, vec!["subnet-priv", "subnet-pub"]);
            assert_eq!(req.security_group_ids, vec!["sg-cp"]);
            assert_eq!(req.log_types.len(), 5);
            Ok(describe_cp(ResourceState::Provisioning))
        });
        let mut cp_polls = 0;
        api.expect_describe_cluster().returning(move |_| {
            cp_polls += 1;
            Ok(describe_cp(if cp_polls < 3 {
                ResourceState::Provisioning
            } else {
                ResourceState::Active
            }))
        });
        api.expect_create_nodegroup().returning(|req| {
            assert_eq!(req.subnet_ids, vec!["subnet-priv"]);
            assert_eq!(req.node_role_arn, "arn:node-role");
            Ok(describe_ng(ResourceState::Provisioning, req.scaling.desired_size))
        });
        api.expect_describe_nodegroup()
            .returning(|_, _| Ok(describe_ng(ResourceState::Active, 2)));

        let (networking, iam) = inputs();
        let mut out = ClusterResources::default();
        manager(api)
            .create(&ClusterConfig::new("t1", "us-east-1"), &networking, &iam, &mut out)
            .await
            .unwrap();

        assert_eq!(out.control_plane.unwrap().status, ResourceState::Active);
        assert_eq!(out.node_groups.len(), 1);
        assert_eq!(out.node_groups[0].status, ResourceState::Active);
        assert!(out.addons.is_empty());
    }

    #[tokio::test]
    async fn failed_control_plane_aborts_with_partial_record() {
        let mut api = MockEksApi::new();
        api.expect_create_cluster()
            .returning(|_| Ok(describe_cp(ResourceState::Provisioning)));
        api.expect_describe_cluster()
            .returning(|_| Ok(describe_cp(ResourceState::Failed("subnet quota".into()))));
        api.expect_create_nodegroup().never();

        let (networking, iam) = inputs();
        let mut out = ClusterResources::default();
        let err = manager(api)
            .create(&ClusterConfig::new("t1", "us-east-1"), &networking, &iam, &mut out)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
        assert!(out.control_plane.is_some());
        assert!(out.node_groups.is_empty());
    }

    #[tokio::test]
    async fn addons_install_when_toggled() {
        let mut api = MockEksApi::new();
        api.expect_create_cluster()
            .returning(|_| Ok(describe_cp(ResourceState::Active)));
        api.expect_describe_cluster()
            .returning(|_| Ok(describe_cp(ResourceState::Active)));
        api.expect_create_nodegroup()
            .returning(|_| Ok(describe_ng(ResourceState::Active, 2)));
        api.expect_describe_nodegroup()
            .returning(|_, _| Ok(describe_ng(ResourceState::Active, 2)));
        api.expect_create_addon().times(2).returning(|_, _| Ok(()));
        api.expect_describe_addon()
            .returning(|_, _| Ok(ResourceState::Active));

        let mut config = ClusterConfig::new("t1", "us-east-1");
        config.addons.ebs_csi_driver = true;
        config.addons.pod_identity_agent = true;

        let (networking, iam) = inputs();
        let mut out = ClusterResources::default();
        manager(api)
            .create(&config, &networking, &iam, &mut out)
            .await
            .unwrap();
        assert_eq!(out.addons, vec![EBS_CSI_ADDON, POD_IDENTITY_ADDON]);
    }

    #[tokio::test]
    async fn delete_removes_node_groups_before_control_plane() {
        let mut seq = mockall::Sequence::new();
        let mut api = MockEksApi::new();
        api.expect_delete_nodegroup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_describe_nodegroup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(not_found("DescribeNodegroup")));
        api.expect_delete_cluster()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        api.expect_describe_cluster()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(not_found("DescribeCluster")));

        let resources = ClusterResources {
            control_plane: Some(control_plane(ResourceState::Active)),
            node_groups: vec![describe_ng(ResourceState::Active, 2).into()],
            addons: vec![],
        };
        let report = manager(api).delete(&resources).await;

        assert!(report.is_clean());
        assert_eq!(report.resource_order(), vec!["node-group", "control-plane"]);
    }

    #[tokio::test]
    async fn delete_attempts_control_plane_even_if_node_group_fails() {
        let mut api = MockEksApi::new();
        api.expect_delete_nodegroup().returning(|_, _| {
            Err(CloudError::new(CloudErrorKind::AccessDenied, "eks", "DeleteNodegroup", "denied"))
        });
        api.expect_delete_cluster().times(1).returning(|_| Ok(()));
        api.expect_describe_cluster()
            .returning(|_| Err(not_found("DescribeCluster")));

        let resources = ClusterResources {
            control_plane: Some(control_plane(ResourceState::Active)),
            node_groups: vec![describe_ng(ResourceState::Active, 2).into()],
            addons: vec![],
        };
        let report = manager(api).delete(&resources).await;
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.entries[1].resource, "control-plane");
    }

    #[tokio::test]
    async fn scaling_waits_for_update_and_refreshes_record() {
        let mut api = MockEksApi::new();
        api.expect_update_nodegroup_config()
            .returning(|_, _, _| Ok("upd-1".to_string()));
        let mut polls = 0;
        api.expect_describe_update().returning(move |_, group, _| {
            assert_eq!(group.as_deref(), Some("t1-nodes"));
            polls += 1;
            Ok(if polls < 2 {
                UpdateStatus::InProgress
            } else {
                UpdateStatus::Successful
            })
        });
        api.expect_describe_nodegroup()
            .returning(|_, _| Ok(describe_ng(ResourceState::Active, 5)));

        let mut resources = ClusterResources {
            control_plane: Some(control_plane(ResourceState::Active)),
            node_groups: vec![describe_ng(ResourceState::Active, 2).into()],
            addons: vec![],
        };
        manager(api)
            .update_node_group(&mut resources, NodeScaling::new(1, 6, 5))
            .await
            .unwrap();
        assert_eq!(resources.node_groups[0].scaling.desired_size, 5);
    }

    #[tokio::test]
    async fn failed_version_update_is_fatal() {
        let mut api = MockEksApi::new();
        api.expect_update_cluster_version()
            .returning(|_, _| Ok("upd-2".to_string()));
        api.expect_describe_update()
            .returning(|_, _, _| Ok(UpdateStatus::Failed("unsupported version".into())));

        let mut resources = ClusterResources {
            control_plane: Some(control_plane(ResourceState::Active)),
            ..Default::default()
        };
        let err = manager(api)
            .update_cluster_version(&mut resources, "1.99")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
        assert_eq!(resources.control_plane.unwrap().version, "1.29");
    }

    #[tokio::test]
    async fn status_counts_ready_nodes() {
        let mut api = MockEksApi::new();
        api.expect_describe_cluster()
            .returning(|_| Ok(describe_cp(ResourceState::Active)));
        api.expect_describe_nodegroup()
            .returning(|_, _| Ok(describe_ng(ResourceState::Active, 2)));

        let resources = ClusterResources {
            control_plane: Some(control_plane(ResourceState::Active)),
            node_groups: vec![describe_ng(ResourceState::Active, 2).into()],
            addons: vec![],
        };
        let status = manager(api).describe_status(&resources).await.unwrap();
        assert_eq!(status.phase, ClusterPhase::Active);
        assert!(status.ready);
        assert_eq!((status.nodes_ready, status.nodes_total), (2, 2));
    }

    #[test]
    fn kubeconfig_uses_exec_plugin_for_region_and_cluster() {
        let config = generate_kubeconfig(&control_plane(ResourceState::Active), "eu-west-1").unwrap();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("eu-west-1"));
        assert!(yaml.contains("--cluster-name"));
        assert!(yaml.contains(EXEC_API_VERSION));
        assert_eq!(
            config.current_context.as_deref(),
            Some("arn:aws:eks:us-east-1:123456789012:cluster/t1")
        );
    }

    #[test]
    fn kubeconfig_requires_endpoint() {
        let mut cp = control_plane(ResourceState::Provisioning);
        cp.endpoint = None;
        assert_eq!(
            generate_kubeconfig(&cp, "us-east-1").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
