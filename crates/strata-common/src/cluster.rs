//! Desired-state cluster configuration
//!
//! A [`ClusterConfig`] is immutable for the duration of one operation and is
//! validated before any resource is touched.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cidr::Ipv4Cidr;
use crate::{Error, Result};

/// Maximum cluster name length accepted by the managed control plane
pub const MAX_CLUSTER_NAME_LEN: usize = 100;
/// Smallest network prefix the subnet planner accepts
pub const MIN_VPC_PREFIX: u8 = 16;
/// Largest network prefix the subnet planner accepts
pub const MAX_VPC_PREFIX: u8 = 24;
/// Minimum availability zones a cluster can span; EKS needs subnets in two
pub const MIN_AZ_COUNT: u32 = 2;
/// Maximum availability zones a cluster can span
pub const MAX_AZ_COUNT: u32 = 6;

/// Cloud provider hosting the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services (EKS)
    #[default]
    Aws,
}

impl CloudProvider {
    /// Key used for this provider's entry in the resource graph
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
        }
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            other => Err(Error::configuration(format!(
                "unknown cloud provider '{}' (supported: aws)",
                other
            ))),
        }
    }
}

/// Virtual network layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Network CIDR (e.g. "10.0.0.0/16")
    #[serde(default = "default_vpc_cidr")]
    pub vpc_cidr: String,
    /// Number of availability zones to spread subnets across
    #[serde(default = "default_az_count")]
    pub az_count: u32,
    /// Create and attach an internet gateway
    #[serde(default = "default_true")]
    pub enable_internet_gateway: bool,
    /// Create one NAT gateway per availability zone
    #[serde(default = "default_true")]
    pub enable_nat_gateway: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            vpc_cidr: default_vpc_cidr(),
            az_count: default_az_count(),
            enable_internet_gateway: true,
            enable_nat_gateway: true,
        }
    }
}

/// Worker node pool shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Instance class (e.g. "t3.medium")
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Minimum node count
    pub min_size: u32,
    /// Maximum node count
    pub max_size: u32,
    /// Desired node count
    pub desired_size: u32,
    /// Root volume size in GiB
    #[serde(default = "default_disk_size")]
    pub disk_size_gb: u32,
    /// Kubernetes labels applied to every node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_type: default_instance_type(),
            min_size: 1,
            max_size: 3,
            desired_size: 2,
            disk_size_gb: default_disk_size(),
            labels: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Check a scaling triple: `1 <= min <= desired <= max`
    pub fn validate_scaling(cluster: &str, min: u32, max: u32, desired: u32) -> Result<()> {
        if min < 1 {
            return Err(Error::configuration_for_field(
                cluster,
                "node.minSize",
                "minimum size must be at least 1",
            ));
        }
        if min > desired {
            return Err(Error::configuration_for_field(
                cluster,
                "node.desiredSize",
                format!("desired size {} is below minimum size {}", desired, min),
            ));
        }
        if desired > max {
            return Err(Error::configuration_for_field(
                cluster,
                "node.desiredSize",
                format!("desired size {} exceeds maximum size {}", desired, max),
            ));
        }
        Ok(())
    }
}

/// Optional managed add-ons
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonsConfig {
    /// Block storage CSI driver
    #[serde(default)]
    pub ebs_csi_driver: bool,
    /// Pod identity agent
    #[serde(default)]
    pub pod_identity_agent: bool,
}

/// Desired state of one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name; also the state key and lock id
    pub name: String,
    /// Hosting provider
    #[serde(default)]
    pub provider: CloudProvider,
    /// Provider region (e.g. "us-east-1")
    pub region: String,
    /// Environment tag (e.g. "dev", "prod")
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Kubernetes minor version (e.g. "1.29")
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,
    /// Network layout
    #[serde(default)]
    pub network: NetworkConfig,
    /// Node pool shape
    #[serde(default)]
    pub node: NodeConfig,
    /// Add-on toggles
    #[serde(default)]
    pub addons: AddonsConfig,
    /// Free-form tags applied to every taggable resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Config with defaults for everything but name and region
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: CloudProvider::Aws,
            region: region.into(),
            environment: default_environment(),
            kubernetes_version: default_kubernetes_version(),
            network: NetworkConfig::default(),
            node: NodeConfig::default(),
            addons: AddonsConfig::default(),
            tags: BTreeMap::new(),
        }
    }

    /// Parse a config document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a config file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&data)
    }

    /// Parsed network CIDR
    pub fn vpc_cidr(&self) -> Result<Ipv4Cidr> {
        self.network.vpc_cidr.parse().map_err(|e: Error| {
            Error::configuration_for_field(&self.name, "network.vpcCidr", e.to_string())
        })
    }

    /// Validate the whole config
    pub fn validate(&self) -> Result<()> {
        self.validate_name()?;

        if self.region.trim().is_empty() {
            return Err(Error::configuration_for_field(
                &self.name,
                "region",
                "region must not be empty",
            ));
        }
        if self.kubernetes_version.trim().is_empty() {
            return Err(Error::configuration_for_field(
                &self.name,
                "kubernetesVersion",
                "kubernetes version must not be empty",
            ));
        }

        let cidr = self.vpc_cidr()?;
        if !(MIN_VPC_PREFIX..=MAX_VPC_PREFIX).contains(&cidr.prefix()) {
            return Err(Error::configuration_for_field(
                &self.name,
                "network.vpcCidr",
                format!(
                    "prefix /{} must be between /{} and /{}",
                    cidr.prefix(),
                    MIN_VPC_PREFIX,
                    MAX_VPC_PREFIX
                ),
            ));
        }
        if !(MIN_AZ_COUNT..=MAX_AZ_COUNT).contains(&self.network.az_count) {
            return Err(Error::configuration_for_field(
                &self.name,
                "network.azCount",
                format!(
                    "availability zone count must be between {} and {}",
                    MIN_AZ_COUNT, MAX_AZ_COUNT
                ),
            ));
        }

        if self.node.instance_type.trim().is_empty() {
            return Err(Error::configuration_for_field(
                &self.name,
                "node.instanceType",
                "instance type must not be empty",
            ));
        }
        if self.node.disk_size_gb < 1 {
            return Err(Error::configuration_for_field(
                &self.name,
                "node.diskSizeGb",
                "disk size must be at least 1 GiB",
            ));
        }
        NodeConfig::validate_scaling(
            &self.name,
            self.node.min_size,
            self.node.max_size,
            self.node.desired_size,
        )
    }

    fn validate_name(&self) -> Result<()> {
        let name = &self.name;
        if name.is_empty() {
            return Err(Error::configuration_for_field(
                name,
                "name",
                "cluster name must not be empty",
            ));
        }
        if name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(Error::configuration_for_field(
                name,
                "name",
                format!("cluster name exceeds {} characters", MAX_CLUSTER_NAME_LEN),
            ));
        }
        if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(Error::configuration_for_field(
                name,
                "name",
                "cluster name must start with a letter",
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::configuration_for_field(
                name,
                "name",
                "cluster name may only contain letters, digits and '-'",
            ));
        }
        Ok(())
    }
}

fn default_vpc_cidr() -> String {
    "10.0.0.0/16".to_string()
}

fn default_az_count() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_instance_type() -> String {
    "t3.medium".to_string()
}

fn default_disk_size() -> u32 {
    20
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_kubernetes_version() -> String {
    "1.29".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use rstest::rstest;

    fn valid() -> ClusterConfig {
        ClusterConfig::new("t1", "us-east-1")
    }

    #[test]
    fn defaults_are_valid() {
        valid().validate().unwrap();
    }

    #[rstest]
    #[case(0, 3, 1)] // min < 1
    #[case(2, 3, 1)] // min > desired
    #[case(1, 3, 4)] // desired > max
    #[case(3, 2, 3)] // desired > max
    fn scaling_triples_are_rejected(#[case] min: u32, #[case] max: u32, #[case] desired: u32) {
        let mut config = valid();
        config.node.min_size = min;
        config.node.max_size = max;
        config.node.desired_size = desired;

        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[rstest]
    #[case(1, 1, 1)]
    #[case(1, 3, 2)]
    #[case(2, 10, 10)]
    fn scaling_triples_are_accepted(#[case] min: u32, #[case] max: u32, #[case] desired: u32) {
        NodeConfig::validate_scaling("t1", min, max, desired).unwrap();
    }

    #[rstest]
    #[case("")]
    #[case("1cluster")]
    #[case("my_cluster")]
    #[case("has space")]
    fn invalid_names_are_rejected(#[case] name: &str) {
        let mut config = valid();
        config.name = name.to_string();
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn empty_region_is_rejected() {
        let mut config = valid();
        config.region = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[rstest]
    #[case("10.0.0.0/8")]
    #[case("10.0.0.0/26")]
    #[case("not-a-cidr")]
    fn unsupported_networks_are_rejected(#[case] cidr: &str) {
        let mut config = valid();
        config.network.vpc_cidr = cidr.to_string();
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[rstest]
    #[case::none(0, false)]
    #[case::single_zone(1, false)]
    #[case::minimum(MIN_AZ_COUNT, true)]
    #[case::maximum(MAX_AZ_COUNT, true)]
    #[case::too_many(MAX_AZ_COUNT + 1, false)]
    fn az_count_is_bounded(#[case] az_count: u32, #[case] accepted: bool) {
        let mut config = valid();
        config.network.az_count = az_count;
        match config.validate() {
            Ok(()) => assert!(accepted, "{} zones accepted", az_count),
            Err(e) => {
                assert!(!accepted, "{} zones rejected: {}", az_count, e);
                assert_eq!(e.kind(), ErrorKind::Configuration);
                assert!(e.to_string().contains("availability zone count"), "{}", e);
            }
        }
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = "gcp".parse::<CloudProvider>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!("AWS".parse::<CloudProvider>().unwrap(), CloudProvider::Aws);
    }

    #[test]
    fn yaml_fills_defaults() {
        let config = ClusterConfig::from_yaml_str(
            r#"
name: t1
region: us-east-1
node:
  minSize: 1
  maxSize: 3
  desiredSize: 2
tags:
  team: platform
"#,
        )
        .unwrap();

        assert_eq!(config.provider, CloudProvider::Aws);
        assert_eq!(config.network.vpc_cidr, "10.0.0.0/16");
        assert_eq!(config.network.az_count, 2);
        assert!(config.network.enable_nat_gateway);
        assert_eq!(config.node.instance_type, "t3.medium");
        assert_eq!(config.tags.get("team").map(String::as_str), Some("platform"));
        config.validate().unwrap();
    }

    #[test]
    fn yaml_with_unknown_provider_fails_to_parse() {
        let result = ClusterConfig::from_yaml_str("name: t1\nregion: x\nprovider: gcp\n");
        assert!(result.is_err());
    }
}
