//! Strata - provision and tear down Kubernetes clusters with lock-protected remote state
//!
//! An [`Orchestrator`] ties a [`StateBackend`](strata_state::StateBackend) to
//! the cloud [`Provider`](strata_common::provider::Provider)s in a
//! [`ProviderRegistry`]. Every mutating workflow holds the cluster's lock for
//! its full duration:
//!
//! - create: lock → refuse existing names → IAM → network → cluster → save
//! - destroy: lock → load → cluster → network → IAM teardown → delete state
//! - update: lock → load → scale or upgrade → save
//!
//! # Crates
//!
//! - [`strata_common`] - cluster model, errors, settings, retries and waits
//! - [`strata_state`] - state backends and lock records
//! - [`strata_aws`] - the AWS provider and its resource managers

#![deny(missing_docs)]

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{Orchestrator, UpdateRequest};
pub use registry::ProviderRegistry;
pub use strata_common::{Error, ErrorKind, Result};
