//! In-process object store and lock table
//!
//! Behave like their cloud counterparts where it matters to the backend:
//! objects are versioned, conditional writes are atomic, a new table starts in
//! `Creating`. Used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::lock::LockRecord;
use crate::store::{
    DeleteCondition, Encryption, LifecycleRule, LockTable, ObjectStore, StoreError, StoreResult,
    TableSpec, TableStatus,
};

/// Configuration applied to an in-memory bucket
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketSettings {
    /// Region the bucket was created in
    pub region: String,
    /// Public access block applied
    pub public_access_blocked: bool,
    /// Versioning enabled
    pub versioning: bool,
    /// Default encryption
    pub encryption: Option<Encryption>,
    /// Lifecycle rules
    pub lifecycle: Vec<LifecycleRule>,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

#[derive(Default)]
struct Bucket {
    settings: BucketSettings,
    // key -> versions, newest last; a `None` version is a delete marker
    objects: BTreeMap<String, Vec<(String, Option<Vec<u8>>)>>,
}

#[derive(Default)]
struct Faults {
    queued: HashMap<String, VecDeque<StoreError>>,
}

impl Faults {
    fn check(&mut self, operation: &str) -> StoreResult<()> {
        match self.queued.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Versioned in-memory blob store
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    faults: Mutex<Faults>,
    version_counter: Mutex<u64>,
}

impl MemoryObjectStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `operation` (e.g. "PutBucketTagging") fail
    pub fn fail_next(&self, operation: &str, err: StoreError) {
        self.faults
            .lock()
            .queued
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    /// Settings of a bucket, if it exists
    pub fn bucket_settings(&self, bucket: &str) -> Option<BucketSettings> {
        self.buckets.lock().get(bucket).map(|b| b.settings.clone())
    }

    /// Number of stored versions of a key, delete markers included
    pub fn version_count(&self, bucket: &str, key: &str) -> usize {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map_or(0, Vec::len)
    }

    fn next_version(&self) -> String {
        let mut counter = self.version_counter.lock();
        *counter += 1;
        format!("v{:06}", *counter)
    }

    fn with_bucket<T>(
        &self,
        operation: &str,
        bucket: &str,
        f: impl FnOnce(&mut Bucket) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.faults.lock().check(operation)?;
        let mut buckets = self.buckets.lock();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::not_found(format!("bucket {}", bucket)))?;
        f(b)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.with_bucket("HeadBucket", bucket, |_| Ok(()))
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> StoreResult<()> {
        self.faults.lock().check("CreateBucket")?;
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Err(StoreError::condition_failed(format!("bucket {}", bucket)));
        }
        buckets.insert(
            bucket.to_string(),
            Bucket {
                settings: BucketSettings {
                    region: region.to_string(),
                    ..Default::default()
                },
                objects: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn put_public_access_block(&self, bucket: &str) -> StoreResult<()> {
        self.with_bucket("PutPublicAccessBlock", bucket, |b| {
            b.settings.public_access_blocked = true;
            Ok(())
        })
    }

    async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> StoreResult<()> {
        self.with_bucket("PutBucketVersioning", bucket, |b| {
            b.settings.versioning = enabled;
            Ok(())
        })
    }

    async fn put_bucket_encryption(&self, bucket: &str, encryption: &Encryption) -> StoreResult<()> {
        self.with_bucket("PutBucketEncryption", bucket, |b| {
            b.settings.encryption = Some(encryption.clone());
            Ok(())
        })
    }

    async fn put_bucket_lifecycle(&self, bucket: &str, rules: &[LifecycleRule]) -> StoreResult<()> {
        self.with_bucket("PutBucketLifecycleConfiguration", bucket, |b| {
            b.settings.lifecycle = rules.to_vec();
            Ok(())
        })
    }

    async fn put_bucket_tagging(
        &self,
        bucket: &str,
        tags: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        self.with_bucket("PutBucketTagging", bucket, |b| {
            b.settings.tags = tags.clone();
            Ok(())
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> StoreResult<String> {
        let version = self.next_version();
        self.with_bucket("PutObject", bucket, |b| {
            let versions = b.objects.entry(key.to_string()).or_default();
            if !b.settings.versioning {
                versions.clear();
            }
            versions.push((version.clone(), Some(body)));
            Ok(version)
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Vec<u8>> {
        self.with_bucket("GetObject", bucket, |b| {
            b.objects
                .get(key)
                .and_then(|versions| versions.last())
                .and_then(|(_, body)| body.clone())
                .ok_or_else(|| StoreError::not_found(key))
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.with_bucket("HeadObject", bucket, |b| {
            match b.objects.get(key).and_then(|versions| versions.last()) {
                Some((_, Some(_))) => Ok(()),
                _ => Err(StoreError::not_found(key)),
            }
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let version = self.next_version();
        self.with_bucket("DeleteObject", bucket, |b| {
            if b.settings.versioning {
                if let Some(versions) = b.objects.get_mut(key) {
                    versions.push((version, None));
                }
            } else {
                b.objects.remove(key);
            }
            Ok(())
        })
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        self.with_bucket("ListObjectsV2", bucket, |b| {
            Ok(b.objects
                .iter()
                .filter(|(key, versions)| {
                    key.starts_with(prefix)
                        && matches!(versions.last(), Some((_, Some(_))))
                })
                .map(|(key, _)| key.clone())
                .collect())
        })
    }
}

struct Table {
    spec: TableSpec,
    status: TableStatus,
    point_in_time_recovery: bool,
    records: BTreeMap<String, LockRecord>,
}

/// In-memory conditional-write table
#[derive(Default)]
pub struct MemoryLockTable {
    tables: Mutex<HashMap<String, Table>>,
    faults: Mutex<Faults>,
}

impl MemoryLockTable {
    /// Empty table service
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `operation` (e.g. "PutItem") fail
    pub fn fail_next(&self, operation: &str, err: StoreError) {
        self.faults
            .lock()
            .queued
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    /// Definition of a table, if it exists
    pub fn table_spec(&self, table: &str) -> Option<TableSpec> {
        self.tables.lock().get(table).map(|t| t.spec.clone())
    }

    /// Whether point-in-time recovery is on
    pub fn point_in_time_recovery(&self, table: &str) -> bool {
        self.tables
            .lock()
            .get(table)
            .is_some_and(|t| t.point_in_time_recovery)
    }

    /// Number of lock records in a table
    pub fn record_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.records.len())
    }

    fn with_table<T>(
        &self,
        operation: &str,
        table: &str,
        f: impl FnOnce(&mut Table) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.faults.lock().check(operation)?;
        let mut tables = self.tables.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::not_found(format!("table {}", table)))?;
        f(t)
    }
}

#[async_trait]
impl LockTable for MemoryLockTable {
    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus> {
        self.with_table("DescribeTable", table, |t| {
            let status = t.status;
            // Tables become active after the first describe.
            if t.status == TableStatus::Creating {
                t.status = TableStatus::Active;
            }
            Ok(status)
        })
    }

    async fn create_table(&self, spec: &TableSpec) -> StoreResult<()> {
        self.faults.lock().check("CreateTable")?;
        let mut tables = self.tables.lock();
        if tables.contains_key(&spec.name) {
            return Err(StoreError::condition_failed(format!("table {}", spec.name)));
        }
        tables.insert(
            spec.name.clone(),
            Table {
                spec: spec.clone(),
                status: TableStatus::Creating,
                point_in_time_recovery: false,
                records: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn enable_point_in_time_recovery(&self, table: &str) -> StoreResult<()> {
        self.with_table("UpdateContinuousBackups", table, |t| {
            t.point_in_time_recovery = true;
            Ok(())
        })
    }

    async fn put_if_absent(&self, table: &str, record: LockRecord) -> StoreResult<()> {
        self.with_table("PutItem", table, |t| {
            if t.records.contains_key(&record.lock_id) {
                return Err(StoreError::condition_failed(record.lock_id));
            }
            t.records.insert(record.lock_id.clone(), record);
            Ok(())
        })
    }

    async fn get(&self, table: &str, lock_id: &str) -> StoreResult<Option<LockRecord>> {
        self.with_table("GetItem", table, |t| Ok(t.records.get(lock_id).cloned()))
    }

    async fn delete(
        &self,
        table: &str,
        lock_id: &str,
        condition: DeleteCondition,
    ) -> StoreResult<()> {
        self.with_table("DeleteItem", table, |t| {
            let Some(existing) = t.records.get(lock_id) else {
                return Ok(());
            };
            if let DeleteCondition::InfoEquals(expected) = &condition {
                if &existing.info != expected {
                    return Err(StoreError::condition_failed(lock_id));
                }
            }
            t.records.remove(lock_id);
            Ok(())
        })
    }
}
