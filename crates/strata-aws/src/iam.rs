//! Identity & access: the control plane role, node role and node instance profile
//!
//! Create is re-runnable: each step reuses what already exists. Delete is
//! best-effort: every step is attempted and recorded.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use strata_common::cluster::ClusterConfig;
use strata_common::config::Timeouts;
use strata_common::teardown::TeardownReport;
use strata_common::{Error, Result};

use crate::api::{ensure, CloudErrorKind, Ensured, IamApi, Role};
use crate::resources::IamResources;
use crate::tags::{cluster_role_name, node_profile_name, node_role_name, resource_tags};

const AWS_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

/// Managed policies attached to the control plane role
pub const CLUSTER_POLICIES: &[&str] = &["AmazonEKSClusterPolicy"];

/// Managed policies attached to the node role
pub const NODE_POLICIES: &[&str] = &[
    "AmazonEKSWorkerNodePolicy",
    "AmazonEKS_CNI_Policy",
    "AmazonEC2ContainerRegistryReadOnly",
];

const EKS_SERVICE_PRINCIPAL: &str = "eks.amazonaws.com";
const EC2_SERVICE_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Full ARN of an AWS-managed policy
pub fn policy_arn(policy: &str) -> String {
    format!("{}{}", AWS_POLICY_PREFIX, policy)
}

/// Trust policy letting `service` assume a role
pub fn trust_policy(service: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// Creates and removes the IAM resources of a cluster
pub struct IamManager {
    api: Arc<dyn IamApi>,
    settle: Duration,
}

impl IamManager {
    /// Create a manager
    pub fn new(api: Arc<dyn IamApi>, timeouts: &Timeouts) -> Self {
        Self {
            api,
            settle: timeouts.iam_settle,
        }
    }

    /// Create both roles and the instance profile, recording each into `out`
    #[instrument(skip(self, config, out), fields(cluster = %config.name))]
    pub async fn create(&self, config: &ClusterConfig, out: &mut IamResources) -> Result<()> {
        self.ensure_role(
            config,
            &cluster_role_name(&config.name),
            EKS_SERVICE_PRINCIPAL,
            CLUSTER_POLICIES,
            &mut out.cluster_role,
        )
        .await?;

        let node_role_name = node_role_name(&config.name);
        self.ensure_role(
            config,
            &node_role_name,
            EC2_SERVICE_PRINCIPAL,
            NODE_POLICIES,
            &mut out.node_role,
        )
        .await?;

        let profile_name = node_profile_name(&config.name);
        let tags = resource_tags(config, &profile_name);
        let api = &self.api;
        let profile = ensure(
            api.create_instance_profile(&profile_name, &tags).await,
            || api.get_instance_profile(&profile_name),
        )
        .await?;
        let created = profile.was_created();
        let profile = profile.into_inner();
        out.node_instance_profile_name = Some(profile.name.clone());
        out.node_instance_profile_arn = Some(profile.arn.clone());

        if !profile.roles.contains(&node_role_name) {
            match api
                .add_role_to_instance_profile(&profile.name, &node_role_name)
                .await
            {
                Ok(()) => {}
                // A profile holds at most one role; a concurrent run may have added it.
                Err(e) if e.is(CloudErrorKind::LimitExceeded) => {
                    debug!(profile = %profile.name, "Instance profile already has a role");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if created {
            self.settle().await;
        }

        info!(
            cluster_role = ?out.cluster_role.as_ref().map(|r| &r.arn),
            node_role = ?out.node_role.as_ref().map(|r| &r.arn),
            "IAM resources ready"
        );
        Ok(())
    }

    /// Create or reuse a role and attach its policies
    ///
    /// The role lands in `slot` as soon as it exists, so a failed attach still
    /// leaves it in the graph for teardown.
    async fn ensure_role(
        &self,
        config: &ClusterConfig,
        name: &str,
        service: &str,
        policies: &[&str],
        slot: &mut Option<Role>,
    ) -> Result<()> {
        let api = &self.api;
        let tags = resource_tags(config, name);
        let role = ensure(
            api.create_role(name, &trust_policy(service), &tags).await,
            || api.get_role(name),
        )
        .await?;

        match &role {
            Ensured::Created(r) => info!(role = %r.name, "Created IAM role"),
            Ensured::AlreadyExisted(r) => info!(role = %r.name, "Reusing existing IAM role"),
        }
        let created = role.was_created();
        let role = slot.insert(role.into_inner());

        for policy in policies {
            api.attach_role_policy(&role.name, &policy_arn(policy))
                .await?;
        }
        if created {
            self.settle().await;
        }
        Ok(())
    }

    async fn settle(&self) {
        if !self.settle.is_zero() {
            debug!(secs = self.settle.as_secs(), "Waiting for IAM propagation");
            tokio::time::sleep(self.settle).await;
        }
    }

    /// Remove the instance profile, then each role with its policies
    #[instrument(skip(self, resources))]
    pub async fn delete(&self, resources: &IamResources) -> TeardownReport {
        let mut report = TeardownReport::new();
        let api = &self.api;

        if let Some(profile) = &resources.node_instance_profile_name {
            if let Some(role) = &resources.node_role {
                let result = api
                    .remove_role_from_instance_profile(profile, &role.name)
                    .await
                    .map_err(Error::from);
                report.record("instance-profile-role", format!("{}/{}", profile, role.name), result);
            }
            let result = api.delete_instance_profile(profile).await.map_err(Error::from);
            report.record("instance-profile", profile.as_str(), result);
        }

        // Reverse of creation: node role first.
        for role in [&resources.node_role, &resources.cluster_role]
            .into_iter()
            .flatten()
        {
            self.delete_role(&role.name, &mut report).await;
        }
        report
    }

    async fn delete_role(&self, name: &str, report: &mut TeardownReport) {
        match self.api.list_attached_role_policies(name).await {
            Ok(policies) => {
                for policy in policies {
                    let result = self
                        .api
                        .detach_role_policy(name, &policy)
                        .await
                        .map_err(Error::from);
                    report.record("role-policy", format!("{}/{}", name, policy), result);
                }
            }
            Err(e) if e.is(CloudErrorKind::NotFound) => {}
            Err(e) => report.failed("role-policy", name, e),
        }

        let result = self.api.delete_role(name).await.map_err(Error::from);
        report.record("role", name, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CloudError, InstanceProfile, MockIamApi};
    use mockall::predicate::function;
    use strata_common::teardown::TeardownOutcome;

    fn role(name: &str) -> Role {
        Role {
            name: name.to_string(),
            arn: format!("arn:aws:iam::123456789012:role/{}", name),
        }
    }

    fn already_exists(op: &str) -> CloudError {
        CloudError::new(CloudErrorKind::AlreadyExists, "iam", op, "EntityAlreadyExists")
    }

    fn manager(api: MockIamApi) -> IamManager {
        IamManager::new(Arc::new(api), &Timeouts::immediate())
    }

    #[tokio::test]
    async fn existing_roles_and_profile_are_reused() {
        let mut api = MockIamApi::new();
        api.expect_create_role()
            .returning(|_, _, _| Err(already_exists("CreateRole")));
        api.expect_get_role().returning(|name| Ok(role(name)));
        api.expect_attach_role_policy().times(4).returning(|_, _| Ok(()));
        api.expect_create_instance_profile()
            .returning(|_, _| Err(already_exists("CreateInstanceProfile")));
        api.expect_get_instance_profile().returning(|name| {
            Ok(InstanceProfile {
                name: name.to_string(),
                arn: format!("arn:aws:iam::123456789012:instance-profile/{}", name),
                roles: vec!["t1-node-role".to_string()],
            })
        });
        api.expect_add_role_to_instance_profile().never();

        let mut out = IamResources::default();
        manager(api)
            .create(&ClusterConfig::new("t1", "us-east-1"), &mut out)
            .await
            .unwrap();

        assert_eq!(out.cluster_role.unwrap().name, "t1-cluster-role");
        assert_eq!(out.node_role.unwrap().name, "t1-node-role");
        assert_eq!(out.node_instance_profile_name.as_deref(), Some("t1-node-profile"));
    }

    #[tokio::test]
    async fn node_role_gets_three_policies() {
        let mut api = MockIamApi::new();
        api.expect_create_role()
            .returning(|name, policy, _| {
                assert!(policy.contains("sts:AssumeRole"));
                Ok(role(name))
            });
        api.expect_attach_role_policy()
            .with(
                function(|r: &str| r == "t1-cluster-role"),
                function(|p: &str| p == policy_arn("AmazonEKSClusterPolicy")),
            )
            .times(1)
            .returning(|_, _| Ok(()));
        for policy in NODE_POLICIES {
            let expected = policy_arn(policy);
            api.expect_attach_role_policy()
                .with(
                    function(|r: &str| r == "t1-node-role"),
                    function(move |p: &str| p == expected),
                )
                .times(1)
                .returning(|_, _| Ok(()));
        }
        api.expect_create_instance_profile().returning(|name, _| {
            Ok(InstanceProfile {
                name: name.to_string(),
                arn: "arn:profile".to_string(),
                roles: vec![],
            })
        });
        api.expect_add_role_to_instance_profile()
            .with(
                function(|p: &str| p == "t1-node-profile"),
                function(|r: &str| r == "t1-node-role"),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let mut out = IamResources::default();
        manager(api)
            .create(&ClusterConfig::new("t1", "us-east-1"), &mut out)
            .await
            .unwrap();
        assert_eq!(out.node_instance_profile_arn.as_deref(), Some("arn:profile"));
    }

    #[tokio::test]
    async fn failure_after_first_role_keeps_partial_output() {
        let mut api = MockIamApi::new();
        api.expect_create_role().returning(|name, _, _| {
            if name.ends_with("node-role") {
                Err(CloudError::new(CloudErrorKind::AccessDenied, "iam", "CreateRole", "denied"))
            } else {
                Ok(role(name))
            }
        });
        api.expect_attach_role_policy().returning(|_, _| Ok(()));

        let mut out = IamResources::default();
        let err = manager(api)
            .create(&ClusterConfig::new("t1", "us-east-1"), &mut out)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), strata_common::ErrorKind::ProviderFatal);
        assert!(out.cluster_role.is_some());
        assert!(out.node_role.is_none());
    }

    #[tokio::test]
    async fn role_is_recorded_before_its_policies() {
        let mut api = MockIamApi::new();
        api.expect_create_role().returning(|name, _, _| Ok(role(name)));
        api.expect_attach_role_policy().returning(|role, _| {
            if role == "t1-node-role" {
                Err(CloudError::new(CloudErrorKind::AccessDenied, "iam", "AttachRolePolicy", "denied"))
            } else {
                Ok(())
            }
        });
        api.expect_create_instance_profile().never();

        let mut out = IamResources::default();
        let err = manager(api)
            .create(&ClusterConfig::new("t1", "us-east-1"), &mut out)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), strata_common::ErrorKind::ProviderFatal);
        assert_eq!(out.node_role.unwrap().name, "t1-node-role");
        assert!(out.node_instance_profile_name.is_none());
    }

    #[tokio::test]
    async fn delete_continues_past_a_failed_role() {
        let mut api = MockIamApi::new();
        api.expect_remove_role_from_instance_profile()
            .returning(|_, _| Ok(()));
        api.expect_delete_instance_profile().returning(|_| Ok(()));
        api.expect_list_attached_role_policies()
            .returning(|_| Ok(vec![policy_arn("SomePolicy")]));
        api.expect_detach_role_policy().returning(|_, _| Ok(()));
        api.expect_delete_role().returning(|name| {
            if name == "t1-node-role" {
                Err(CloudError::new(CloudErrorKind::DependencyViolation, "iam", "DeleteRole", "in use"))
            } else {
                Ok(())
            }
        });

        let resources = IamResources {
            cluster_role: Some(role("t1-cluster-role")),
            node_role: Some(role("t1-node-role")),
            node_instance_profile_name: Some("t1-node-profile".into()),
            node_instance_profile_arn: Some("arn:profile".into()),
        };
        let report = manager(api).delete(&resources).await;

        let roles: Vec<_> = report
            .entries
            .iter()
            .filter(|e| e.resource == "role")
            .collect();
        assert_eq!(roles.len(), 2);
        assert!(matches!(roles[0].outcome, TeardownOutcome::Failed(_)));
        assert_eq!(roles[1].id, "t1-cluster-role");
        assert_eq!(roles[1].outcome, TeardownOutcome::Deleted);
        assert_eq!(
            report.resource_order(),
            vec!["instance-profile-role", "instance-profile", "role-policy", "role", "role-policy", "role"]
        );
    }

    #[tokio::test]
    async fn delete_of_empty_graph_does_nothing() {
        let report = manager(MockIamApi::new()).delete(&IamResources::default()).await;
        assert!(report.entries.is_empty());
    }
}
