//! Common types for Strata: cluster model, errors, settings and utilities

#![deny(missing_docs)]

pub mod cidr;
pub mod cluster;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod lifecycle;
pub mod provider;
pub mod retry;
pub mod state;
pub mod teardown;
pub mod telemetry;
pub mod wait;

pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Tag key marking every resource Strata manages
pub const MANAGED_BY_TAG: &str = "managed-by";

/// Value of [`MANAGED_BY_TAG`]
pub const MANAGED_BY_VALUE: &str = "strata";

/// Tag key recording which cluster owns a provider resource
pub const CLUSTER_TAG: &str = "strata.io/cluster";
