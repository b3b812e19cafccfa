//! AWS provider for Strata
//!
//! Three managers own one layer of the resource graph each:
//!
//! - [`iam::IamManager`]: control plane role, node role, node instance profile
//! - [`network::NetworkManager`]: VPC, subnets, gateways, route tables, security groups
//! - [`cluster::ClusterManager`]: EKS control plane, node group, add-ons
//!
//! [`AwsProvider`] sequences them behind the
//! [`Provider`](strata_common::provider::Provider) trait. All cloud access goes
//! through the traits in [`api`]; [`sim::SimulatedCloud`] implements them
//! in-process; with the `sdk` feature, [`sdk`] implements them over the AWS
//! SDK.

#![deny(missing_docs)]

pub mod api;
pub mod cluster;
pub mod iam;
pub mod network;
pub mod provider;
pub mod resources;
#[cfg(feature = "sdk")]
pub mod sdk;
pub mod sim;
pub mod tags;

pub use api::{CloudError, CloudErrorKind, Ec2Api, EksApi, IamApi};
pub use provider::{AwsClients, AwsProvider, PROVIDER_NAME};
pub use resources::AwsResources;
pub use sim::SimulatedCloud;
