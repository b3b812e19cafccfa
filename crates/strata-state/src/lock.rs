//! Lock records
//!
//! A lock is a single row in a conditional-write table. Its existence is what
//! excludes other operations; the payload only identifies the holder.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strata_common::Result;

/// Attribute holding the lock id (table partition key)
pub const LOCK_ID_ATTRIBUTE: &str = "LockID";

/// Who holds a lock and why
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LockInfo {
    /// Owner token; required to release the lock
    #[serde(rename = "ID")]
    pub id: String,
    /// Operation holding the lock (e.g. "create", "destroy")
    pub operation: String,
    /// `user@host` of the holder
    pub who: String,
    /// Acquisition time
    pub created: DateTime<Utc>,
    /// Strata version of the holder
    pub version: String,
}

impl LockInfo {
    /// Fresh lock info with a new owner token
    pub fn new(operation: &str, who: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            who: who.to_string(),
            created: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Row stored in the lock table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LockRecord {
    /// Lock id (partition key)
    #[serde(rename = "LockID")]
    pub lock_id: String,
    /// JSON-encoded [`LockInfo`]
    pub info: String,
    /// RFC 3339 creation time
    pub created: String,
}

impl LockRecord {
    /// Build the row for a lock id and holder
    pub fn new(lock_id: &str, info: &LockInfo) -> Result<Self> {
        Ok(Self {
            lock_id: lock_id.to_string(),
            info: serde_json::to_string(info)?,
            created: info.created.to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    /// Decode the holder
    pub fn lock_info(&self) -> Result<LockInfo> {
        Ok(serde_json::from_str(&self.info)?)
    }
}

/// Proof of a held lock, returned by `lock` and required by `unlock`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    /// Cluster name
    pub name: String,
    /// Backend-specific lock id
    pub lock_id: String,
    /// Holder details as written
    pub info: LockInfo,
}

impl LockHandle {
    /// Owner token bound to this handle
    pub fn owner_token(&self) -> &str {
        &self.info.id
    }
}
