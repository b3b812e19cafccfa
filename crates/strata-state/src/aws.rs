//! S3 and DynamoDB clients behind [`ObjectStore`] and [`LockTable`]
//!
//! Only built with the `aws` feature. Every SDK failure is classified with
//! [`StoreError::from_code`]; transport failures and timeouts are transient.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    PointInTimeRecoverySpecification, ProvisionedThroughput, ScalarAttributeType,
    SseSpecification, TableStatus as DynamoTableStatus,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    AbortIncompleteMultipartUpload, BucketLifecycleConfiguration, BucketLocationConstraint,
    BucketVersioningStatus, CreateBucketConfiguration, ExpirationStatus,
    LifecycleRule as S3LifecycleRule, NoncurrentVersionExpiration,
    PublicAccessBlockConfiguration, ServerSideEncryption, ServerSideEncryptionByDefault,
    ServerSideEncryptionConfiguration, ServerSideEncryptionRule, Tagging, VersioningConfiguration,
};
use tracing::debug;

use crate::lock::{LockRecord, LOCK_ID_ATTRIBUTE};
use crate::store::{
    DeleteCondition, Encryption, LifecycleRule, LockTable, ObjectStore, StoreError, StoreResult,
    TableSpec, TableStatus,
};
use crate::url::BackendClients;

const INFO_ATTRIBUTE: &str = "Info";
const CREATED_ATTRIBUTE: &str = "Created";
/// S3 rejects a location constraint naming its default region
const S3_DEFAULT_REGION: &str = "us-east-1";
/// Capacity for lock tables that are not on-demand; lock traffic is tiny
const PROVISIONED_CAPACITY: i64 = 5;

/// Classify an SDK failure for `what`
fn store_error<E, R>(operation: &str, what: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    match &err {
        SdkError::ServiceError(_) => {
            StoreError::from_code(operation, err.code().unwrap_or_default(), what, &message)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::transient(operation, message)
        }
        _ => StoreError::other(operation, message),
    }
}

/// A request that could not be assembled
fn invalid(operation: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::other(operation, format!("invalid request: {}", err))
}

impl BackendClients {
    /// S3 and DynamoDB clients from a loaded AWS configuration
    pub fn from_sdk_config(config: &SdkConfig) -> Self {
        Self {
            object_store: Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(config))),
            lock_table: Arc::new(DynamoLockTable::new(aws_sdk_dynamodb::Client::new(config))),
        }
    }
}

// =============================================================================
// S3
// =============================================================================

/// [`ObjectStore`] over an S3 client
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Wrap a client
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| store_error("HeadBucket", bucket, e))?;
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> StoreResult<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if region != S3_DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| store_error("CreateBucket", bucket, e))?;
        debug!(bucket, region, "Created bucket");
        Ok(())
    }

    async fn put_public_access_block(&self, bucket: &str) -> StoreResult<()> {
        let block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .ignore_public_acls(true)
            .block_public_policy(true)
            .restrict_public_buckets(true)
            .build();
        self.client
            .put_public_access_block()
            .bucket(bucket)
            .public_access_block_configuration(block)
            .send()
            .await
            .map_err(|e| store_error("PutPublicAccessBlock", bucket, e))?;
        Ok(())
    }

    async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> StoreResult<()> {
        let status = if enabled {
            BucketVersioningStatus::Enabled
        } else {
            BucketVersioningStatus::Suspended
        };
        self.client
            .put_bucket_versioning()
            .bucket(bucket)
            .versioning_configuration(VersioningConfiguration::builder().status(status).build())
            .send()
            .await
            .map_err(|e| store_error("PutBucketVersioning", bucket, e))?;
        Ok(())
    }

    async fn put_bucket_encryption(&self, bucket: &str, encryption: &Encryption) -> StoreResult<()> {
        const OP: &str = "PutBucketEncryption";
        let default = match encryption {
            Encryption::Aes256 => ServerSideEncryptionByDefault::builder()
                .sse_algorithm(ServerSideEncryption::Aes256),
            Encryption::Kms { key_id } => ServerSideEncryptionByDefault::builder()
                .sse_algorithm(ServerSideEncryption::AwsKms)
                .kms_master_key_id(key_id),
        }
        .build()
        .map_err(|e| invalid(OP, e))?;
        let configuration = ServerSideEncryptionConfiguration::builder()
            .rules(
                ServerSideEncryptionRule::builder()
                    .apply_server_side_encryption_by_default(default)
                    .bucket_key_enabled(true)
                    .build(),
            )
            .build()
            .map_err(|e| invalid(OP, e))?;
        self.client
            .put_bucket_encryption()
            .bucket(bucket)
            .server_side_encryption_configuration(configuration)
            .send()
            .await
            .map_err(|e| store_error(OP, bucket, e))?;
        Ok(())
    }

    #[allow(deprecated)]
    async fn put_bucket_lifecycle(&self, bucket: &str, rules: &[LifecycleRule]) -> StoreResult<()> {
        const OP: &str = "PutBucketLifecycleConfiguration";
        let mut s3_rules = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut builder = S3LifecycleRule::builder()
                .id(&rule.id)
                .status(ExpirationStatus::Enabled)
                .prefix("");
            if let Some(days) = rule.noncurrent_version_expiration_days {
                builder = builder.noncurrent_version_expiration(
                    NoncurrentVersionExpiration::builder()
                        .noncurrent_days(days as i32)
                        .build(),
                );
            }
            if let Some(days) = rule.abort_incomplete_multipart_days {
                builder = builder.abort_incomplete_multipart_upload(
                    AbortIncompleteMultipartUpload::builder()
                        .days_after_initiation(days as i32)
                        .build(),
                );
            }
            s3_rules.push(builder.build().map_err(|e| invalid(OP, e))?);
        }
        let configuration = BucketLifecycleConfiguration::builder()
            .set_rules(Some(s3_rules))
            .build()
            .map_err(|e| invalid(OP, e))?;
        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(bucket)
            .lifecycle_configuration(configuration)
            .send()
            .await
            .map_err(|e| store_error(OP, bucket, e))?;
        Ok(())
    }

    async fn put_bucket_tagging(
        &self,
        bucket: &str,
        tags: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        const OP: &str = "PutBucketTagging";
        let tag_set = tags
            .iter()
            .map(|(k, v)| aws_sdk_s3::types::Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(OP, e))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| invalid(OP, e))?;
        self.client
            .put_bucket_tagging()
            .bucket(bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| store_error(OP, bucket, e))?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> StoreResult<String> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| store_error("PutObject", key, e))?;
        // Unversioned buckets report no version; S3 calls that version "null"
        Ok(output.version_id().unwrap_or("null").to_string())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("GetObject", key, e))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transient("GetObject", e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("HeadObject", key, e))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("DeleteObject", key, e))?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| store_error("ListObjectsV2", bucket, e))?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}

// =============================================================================
// DynamoDB
// =============================================================================

/// [`LockTable`] over a DynamoDB client
#[derive(Clone, Debug)]
pub struct DynamoLockTable {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoLockTable {
    /// Wrap a client
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }
}

fn string_attribute(
    item: &HashMap<String, AttributeValue>,
    name: &str,
    lock_id: &str,
) -> StoreResult<String> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| StoreError::other("GetItem", format!("lock {} has no {}", lock_id, name)))
}

#[async_trait]
impl LockTable for DynamoLockTable {
    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus> {
        let output = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| store_error("DescribeTable", table, e))?;
        let status = output.table().and_then(|t| t.table_status());
        Ok(match status {
            Some(DynamoTableStatus::Active) => TableStatus::Active,
            Some(DynamoTableStatus::Deleting) => TableStatus::Deleting,
            // Updating tables still serve reads and writes
            Some(DynamoTableStatus::Updating) => TableStatus::Active,
            _ => TableStatus::Creating,
        })
    }

    async fn create_table(&self, spec: &TableSpec) -> StoreResult<()> {
        const OP: &str = "CreateTable";
        let attribute = AttributeDefinition::builder()
            .attribute_name(&spec.hash_key)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| invalid(OP, e))?;
        let key = KeySchemaElement::builder()
            .attribute_name(&spec.hash_key)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| invalid(OP, e))?;
        let tags = spec
            .tags
            .iter()
            .map(|(k, v)| aws_sdk_dynamodb::types::Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(OP, e))?;

        let mut request = self
            .client
            .create_table()
            .table_name(&spec.name)
            .attribute_definitions(attribute)
            .key_schema(key)
            .sse_specification(SseSpecification::builder().enabled(spec.sse_enabled).build())
            .set_tags(Some(tags).filter(|t| !t.is_empty()));
        request = if spec.on_demand {
            request.billing_mode(BillingMode::PayPerRequest)
        } else {
            request.billing_mode(BillingMode::Provisioned).provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(PROVISIONED_CAPACITY)
                    .write_capacity_units(PROVISIONED_CAPACITY)
                    .build()
                    .map_err(|e| invalid(OP, e))?,
            )
        };
        request
            .send()
            .await
            .map_err(|e| store_error(OP, &spec.name, e))?;
        debug!(table = %spec.name, "Created lock table");
        Ok(())
    }

    async fn enable_point_in_time_recovery(&self, table: &str) -> StoreResult<()> {
        const OP: &str = "UpdateContinuousBackups";
        let recovery = PointInTimeRecoverySpecification::builder()
            .point_in_time_recovery_enabled(true)
            .build()
            .map_err(|e| invalid(OP, e))?;
        self.client
            .update_continuous_backups()
            .table_name(table)
            .point_in_time_recovery_specification(recovery)
            .send()
            .await
            .map_err(|e| store_error(OP, table, e))?;
        Ok(())
    }

    async fn put_if_absent(&self, table: &str, record: LockRecord) -> StoreResult<()> {
        self.client
            .put_item()
            .table_name(table)
            .item(LOCK_ID_ATTRIBUTE, AttributeValue::S(record.lock_id.clone()))
            .item(INFO_ATTRIBUTE, AttributeValue::S(record.info))
            .item(CREATED_ATTRIBUTE, AttributeValue::S(record.created))
            .condition_expression("attribute_not_exists(#id)")
            .expression_attribute_names("#id", LOCK_ID_ATTRIBUTE)
            .send()
            .await
            .map_err(|e| store_error("PutItem", &record.lock_id, e))?;
        Ok(())
    }

    async fn get(&self, table: &str, lock_id: &str) -> StoreResult<Option<LockRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .key(LOCK_ID_ATTRIBUTE, AttributeValue::S(lock_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| store_error("GetItem", lock_id, e))?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        Ok(Some(LockRecord {
            lock_id: lock_id.to_string(),
            info: string_attribute(item, INFO_ATTRIBUTE, lock_id)?,
            created: string_attribute(item, CREATED_ATTRIBUTE, lock_id).unwrap_or_default(),
        }))
    }

    async fn delete(
        &self,
        table: &str,
        lock_id: &str,
        condition: DeleteCondition,
    ) -> StoreResult<()> {
        let mut request = self
            .client
            .delete_item()
            .table_name(table)
            .key(LOCK_ID_ATTRIBUTE, AttributeValue::S(lock_id.to_string()));
        if let DeleteCondition::InfoEquals(expected) = condition {
            // A record that is already gone satisfies the delete
            request = request
                .condition_expression("attribute_not_exists(#id) OR #info = :info")
                .expression_attribute_names("#id", LOCK_ID_ATTRIBUTE)
                .expression_attribute_names("#info", INFO_ATTRIBUTE)
                .expression_attribute_values(":info", AttributeValue::S(expected));
        }
        request
            .send()
            .await
            .map_err(|e| store_error("DeleteItem", lock_id, e))?;
        Ok(())
    }
}
