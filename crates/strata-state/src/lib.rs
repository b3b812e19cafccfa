//! Lock-protected state storage for Strata clusters
//!
//! One [`ClusterState`](strata_common::state::ClusterState) per cluster name,
//! guarded by a conditional-write lock record. Backends:
//!
//! - [`S3Backend`]: versioned, encrypted bucket plus a lock table
//! - [`LocalBackend`]: a directory with lock files, for single-operator use
//!
//! The `aws` feature adds S3 and DynamoDB clients for the remote backend
//! ([`aws::S3ObjectStore`], [`aws::DynamoLockTable`]).

#![deny(missing_docs)]

#[cfg(feature = "aws")]
pub mod aws;
pub mod backend;
pub mod local;
pub mod lock;
pub mod memory;
pub mod s3;
pub mod store;
pub mod url;

pub use backend::{BackendInfo, StateBackend};
pub use local::LocalBackend;
pub use lock::{LockHandle, LockInfo};
pub use memory::{MemoryLockTable, MemoryObjectStore};
pub use s3::{S3Backend, S3Location};
pub use store::{LockTable, ObjectStore, StoreError};
pub use url::{resolve_backend, BackendClients, BackendUrl};
