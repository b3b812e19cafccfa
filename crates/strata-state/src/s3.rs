//! Remote backend over a versioned bucket and a conditional-write lock table
//!
//! State lives at `{prefix}clusters/{name}/state.json` in the bucket. Locks
//! are rows keyed `{bucket}/{prefix}clusters/{name}` in the lock table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use strata_common::state::ClusterState;
use strata_common::wait::{wait_until, WaitPolicy};
use strata_common::{Error, Result, MANAGED_BY_TAG, MANAGED_BY_VALUE};

use crate::backend::{check_name, name_from_key, state_key, BackendInfo, StateBackend, CLUSTERS_PREFIX};
use crate::lock::{LockHandle, LockInfo, LockRecord, LOCK_ID_ATTRIBUTE};
use crate::store::{
    DeleteCondition, Encryption, LifecycleRule, LockTable, ObjectStore, StoreError, TableSpec,
    TableStatus,
};

/// Lock table used when the backend URL names none
pub const DEFAULT_LOCK_TABLE: &str = "strata-locks";

/// Days noncurrent state versions are retained
pub const NONCURRENT_VERSION_RETENTION_DAYS: u32 = 90;

/// Days before incomplete multipart uploads are aborted
pub const ABORT_MULTIPART_DAYS: u32 = 7;

/// Where and how the remote backend stores state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Location {
    /// Bucket name
    pub bucket: String,
    /// Key prefix, empty or ending in `/`
    pub prefix: String,
    /// Lock table name
    pub lock_table: String,
    /// Region for the bucket and table
    pub region: String,
    /// Customer-managed KMS key; provider-managed AES256 when absent
    pub kms_key_id: Option<String>,
}

impl S3Location {
    /// Location with the default lock table and no prefix
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            region: region.into(),
            kms_key_id: None,
        }
    }

    fn encryption(&self) -> Encryption {
        match &self.kms_key_id {
            Some(key_id) => Encryption::Kms {
                key_id: key_id.clone(),
            },
            None => Encryption::Aes256,
        }
    }
}

/// State backend over [`ObjectStore`] + [`LockTable`]
pub struct S3Backend {
    location: S3Location,
    owner: String,
    objects: Arc<dyn ObjectStore>,
    locks: Arc<dyn LockTable>,
    table_wait: WaitPolicy,
}

impl S3Backend {
    /// Create a backend; nothing is contacted until a method is called
    pub fn new(
        location: S3Location,
        owner: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        locks: Arc<dyn LockTable>,
        table_wait: WaitPolicy,
    ) -> Self {
        Self {
            location,
            owner: owner.into(),
            objects,
            locks,
            table_wait,
        }
    }

    /// Storage location
    pub fn location(&self) -> &S3Location {
        &self.location
    }

    fn key(&self, name: &str) -> String {
        state_key(&self.location.prefix, name)
    }

    fn lock_id(&self, name: &str) -> String {
        format!(
            "{}/{}{}{}",
            self.location.bucket, self.location.prefix, CLUSTERS_PREFIX, name
        )
    }

    fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string())])
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let bucket = &self.location.bucket;
        match self.objects.head_bucket(bucket).await {
            Ok(()) => debug!(bucket = %bucket, "State bucket exists"),
            Err(StoreError::NotFound { .. }) => {
                info!(bucket = %bucket, region = %self.location.region, "Creating state bucket");
                match self.objects.create_bucket(bucket, &self.location.region).await {
                    Ok(()) | Err(StoreError::ConditionFailed { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.objects.put_public_access_block(bucket).await?;
        self.objects.put_bucket_versioning(bucket, true).await?;
        self.objects
            .put_bucket_encryption(bucket, &self.location.encryption())
            .await?;
        self.objects
            .put_bucket_lifecycle(bucket, &lifecycle_rules())
            .await?;

        if let Err(e) = self.objects.put_bucket_tagging(bucket, &self.tags()).await {
            warn!(bucket = %bucket, error = %e, "Could not tag state bucket, continuing");
        }
        Ok(())
    }

    async fn ensure_lock_table(&self) -> Result<()> {
        let table = &self.location.lock_table;
        match self.locks.describe_table(table).await {
            Ok(status) => debug!(table = %table, ?status, "Lock table exists"),
            Err(StoreError::NotFound { .. }) => {
                info!(table = %table, "Creating lock table");
                let spec = TableSpec {
                    name: table.clone(),
                    hash_key: LOCK_ID_ATTRIBUTE.to_string(),
                    on_demand: true,
                    sse_enabled: true,
                    tags: self.tags(),
                };
                match self.locks.create_table(&spec).await {
                    Ok(()) | Err(StoreError::ConditionFailed { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        let locks = &self.locks;
        wait_until(self.table_wait, &format!("lock table {}", table), || async move {
            match locks.describe_table(table).await? {
                TableStatus::Active => Ok(Some(())),
                _ => Ok(None),
            }
        })
        .await?;

        if let Err(e) = self.locks.enable_point_in_time_recovery(table).await {
            warn!(table = %table, error = %e, "Could not enable point-in-time recovery, continuing");
        }
        Ok(())
    }
}

fn lifecycle_rules() -> Vec<LifecycleRule> {
    vec![
        LifecycleRule {
            id: "expire-noncurrent-state".to_string(),
            noncurrent_version_expiration_days: Some(NONCURRENT_VERSION_RETENTION_DAYS),
            abort_incomplete_multipart_days: None,
        },
        LifecycleRule {
            id: "abort-incomplete-uploads".to_string(),
            noncurrent_version_expiration_days: None,
            abort_incomplete_multipart_days: Some(ABORT_MULTIPART_DAYS),
        },
    ]
}

#[async_trait]
impl StateBackend for S3Backend {
    #[instrument(skip(self), fields(bucket = %self.location.bucket, table = %self.location.lock_table))]
    async fn initialize(&self) -> Result<()> {
        self.ensure_bucket().await?;
        self.ensure_lock_table().await?;
        info!("State backend ready");
        Ok(())
    }

    async fn save(&self, name: &str, state: &ClusterState) -> Result<()> {
        check_name(name)?;
        let key = self.key(name);
        let version = self
            .objects
            .put_object(&self.location.bucket, &key, state.to_json()?)
            .await?;
        debug!(cluster = %name, key = %key, version = %version, "Saved state");
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<ClusterState> {
        check_name(name)?;
        let key = self.key(name);
        match self.objects.get_object(&self.location.bucket, &key).await {
            Ok(body) => ClusterState::from_json(&body),
            Err(StoreError::NotFound { .. }) => Err(Error::not_found("cluster state", name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        if !self.exists(name).await? {
            return Err(Error::not_found("cluster state", name));
        }
        let key = self.key(name);
        self.objects
            .delete_object(&self.location.bucket, &key)
            .await?;
        debug!(cluster = %name, key = %key, "Deleted state");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{}", self.location.prefix, CLUSTERS_PREFIX);
        let keys = self
            .objects
            .list_objects(&self.location.bucket, &prefix)
            .await?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|key| name_from_key(&self.location.prefix, key))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        match self
            .objects
            .head_object(&self.location.bucket, &self.key(name))
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock(&self, name: &str, operation: &str) -> Result<LockHandle> {
        check_name(name)?;
        let lock_id = self.lock_id(name);
        let info = LockInfo::new(operation, &self.owner);
        let record = LockRecord::new(&lock_id, &info)?;

        match self
            .locks
            .put_if_absent(&self.location.lock_table, record)
            .await
        {
            Ok(()) => {
                info!(cluster = %name, lock_id = %lock_id, operation = %operation, "Acquired lock");
                Ok(LockHandle {
                    name: name.to_string(),
                    lock_id,
                    info,
                })
            }
            Err(StoreError::ConditionFailed { .. }) => {
                let holder = self.lock_info(name).await.ok().flatten();
                Err(Error::conflict(name, held_message(holder.as_ref())))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<()> {
        let expected = LockRecord::new(&handle.lock_id, &handle.info)?;
        match self
            .locks
            .delete(
                &self.location.lock_table,
                &handle.lock_id,
                DeleteCondition::InfoEquals(expected.info),
            )
            .await
        {
            Ok(()) => {
                info!(cluster = %handle.name, lock_id = %handle.lock_id, "Released lock");
                Ok(())
            }
            Err(StoreError::ConditionFailed { .. }) => Err(Error::conflict(
                &handle.name,
                "lock is held by a different owner; not released",
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn force_unlock(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let lock_id = self.lock_id(name);
        self.locks
            .delete(&self.location.lock_table, &lock_id, DeleteCondition::Always)
            .await?;
        warn!(cluster = %name, lock_id = %lock_id, "Force-released lock");
        Ok(())
    }

    async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>> {
        check_name(name)?;
        self.locks
            .get(&self.location.lock_table, &self.lock_id(name))
            .await?
            .map(|record| record.lock_info())
            .transpose()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: "s3".to_string(),
            location: format!("s3://{}/{}", self.location.bucket, self.location.prefix),
            region: Some(self.location.region.clone()),
            encrypted: true,
            versioned: true,
            locking: true,
        }
    }
}

/// Conflict message naming the current holder when known
pub(crate) fn held_message(holder: Option<&LockInfo>) -> String {
    match holder {
        Some(h) => format!(
            "locked by {} for '{}' since {}",
            h.who,
            h.operation,
            h.created.to_rfc3339()
        ),
        None => "lock is already held".to_string(),
    }
}
