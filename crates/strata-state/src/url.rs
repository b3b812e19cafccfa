//! Backend selection from a location URL
//!
//! ```text
//! s3://<bucket>[/<path>][?lock_table=<t>&region=<r>&kms_key_id=<k>]
//! file://<dir>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use strata_common::config::Settings;
use strata_common::{Error, Result};

use crate::backend::StateBackend;
use crate::local::LocalBackend;
use crate::s3::{S3Backend, S3Location};
use crate::store::{LockTable, ObjectStore};

/// A parsed backend URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendUrl {
    /// Bucket + lock table
    S3(S3Location),
    /// Local directory
    Local(PathBuf),
}

/// Storage clients for remote backends
///
/// URL resolution cannot construct cloud clients itself; callers inject them.
#[derive(Clone)]
pub struct BackendClients {
    /// Blob store for state objects
    pub object_store: Arc<dyn ObjectStore>,
    /// Conditional-write table for locks
    pub lock_table: Arc<dyn LockTable>,
}

impl BackendUrl {
    /// Parse a backend URL, taking the region default from `default_region`
    pub fn parse(url: &str, default_region: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            Error::configuration(format!("backend URL '{}' has no scheme", url))
        })?;

        match scheme {
            "s3" => parse_s3(url, rest, default_region).map(Self::S3),
            "file" => {
                if rest.is_empty() {
                    return Err(Error::configuration(format!(
                        "backend URL '{}' has no directory",
                        url
                    )));
                }
                Ok(Self::Local(PathBuf::from(rest)))
            }
            other => Err(Error::configuration(format!(
                "unsupported backend type '{}' in '{}'",
                other, url
            ))),
        }
    }
}

fn parse_s3(url: &str, rest: &str, default_region: &str) -> Result<S3Location> {
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    let (bucket, prefix) = match path.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
        None => (path, ""),
    };
    if bucket.is_empty() {
        return Err(Error::configuration(format!(
            "backend URL '{}' has no bucket",
            url
        )));
    }

    let mut location = S3Location::new(bucket, default_region);
    if !prefix.is_empty() {
        location.prefix = format!("{}/", prefix);
    }

    for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if value.is_empty() {
            return Err(Error::configuration(format!(
                "backend URL parameter '{}' has no value",
                key
            )));
        }
        match key {
            "lock_table" => location.lock_table = value.to_string(),
            "region" => location.region = value.to_string(),
            "kms_key_id" => location.kms_key_id = Some(value.to_string()),
            other => {
                return Err(Error::configuration(format!(
                    "unknown backend URL parameter '{}'",
                    other
                )))
            }
        }
    }

    Ok(location)
}

/// Build the backend named by `settings.backend_url`
///
/// Remote backends need `clients`; local ones ignore them.
pub fn resolve_backend(
    settings: &Settings,
    clients: Option<&BackendClients>,
) -> Result<Arc<dyn StateBackend>> {
    match BackendUrl::parse(&settings.backend_url, &settings.region)? {
        BackendUrl::S3(location) => {
            let clients = clients.ok_or_else(|| {
                Error::configuration(format!(
                    "backend '{}' needs object store and lock table clients",
                    settings.backend_url
                ))
            })?;
            info!(bucket = %location.bucket, table = %location.lock_table, "Using remote state backend");
            Ok(Arc::new(S3Backend::new(
                location,
                &settings.owner,
                clients.object_store.clone(),
                clients.lock_table.clone(),
                settings.timeouts.lock_table,
            )))
        }
        BackendUrl::Local(root) => {
            info!(root = %root.display(), "Using local state backend");
            Ok(Arc::new(LocalBackend::new(root, &settings.owner)))
        }
    }
}
