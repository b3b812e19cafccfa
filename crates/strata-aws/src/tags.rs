//! Tags and names applied to every AWS resource of a cluster

use strata_common::cluster::ClusterConfig;
use strata_common::{CLUSTER_TAG, MANAGED_BY_TAG, MANAGED_BY_VALUE};

use crate::api::Tags;

/// Tag marking public subnets for internet-facing load balancers
pub const ELB_ROLE_TAG: &str = "kubernetes.io/role/elb";
/// Tag marking private subnets for internal load balancers
pub const INTERNAL_ELB_ROLE_TAG: &str = "kubernetes.io/role/internal-elb";

/// Base tags for a cluster resource named `resource_name`
pub fn resource_tags(config: &ClusterConfig, resource_name: &str) -> Tags {
    let mut tags = config.tags.clone();
    tags.insert("Name".to_string(), resource_name.to_string());
    tags.insert(CLUSTER_TAG.to_string(), config.name.clone());
    tags.insert("environment".to_string(), config.environment.clone());
    tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());
    tags.insert(
        format!("kubernetes.io/cluster/{}", config.name),
        "owned".to_string(),
    );
    tags
}

/// Tags for a subnet, including its load-balancer role
pub fn subnet_tags(config: &ClusterConfig, resource_name: &str, public: bool) -> Tags {
    let mut tags = resource_tags(config, resource_name);
    let role = if public { ELB_ROLE_TAG } else { INTERNAL_ELB_ROLE_TAG };
    tags.insert(role.to_string(), "1".to_string());
    tags
}

/// Control plane role name
pub fn cluster_role_name(cluster: &str) -> String {
    format!("{}-cluster-role", cluster)
}

/// Node role name
pub fn node_role_name(cluster: &str) -> String {
    format!("{}-node-role", cluster)
}

/// Node instance profile name
pub fn node_profile_name(cluster: &str) -> String {
    format!("{}-node-profile", cluster)
}

/// Node group name
pub fn node_group_name(cluster: &str) -> String {
    format!("{}-nodes", cluster)
}
