//! Storage seams under the remote backend
//!
//! [`ObjectStore`] is a versioned blob store (bucket + key) and [`LockTable`]
//! is a strongly-consistent table with conditional writes. Cloud SDK adapters
//! implement these; [`crate::memory`] provides in-process implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_common::Error;

use crate::lock::LockRecord;

/// Errors reported by the storage seams
///
/// Stores never retry; they classify and the caller decides.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The bucket, key, table or record does not exist
    #[error("{what} not found")]
    NotFound {
        /// What was missing
        what: String,
    },
    /// A conditional write or delete was rejected
    #[error("condition failed on {what}")]
    ConditionFailed {
        /// What the condition guarded
        what: String,
    },
    /// Credentials lack permission
    #[error("{operation}: access denied: {message}")]
    AccessDenied {
        /// Operation attempted
        operation: String,
        /// Provider message
        message: String,
    },
    /// Throttling or network failure
    #[error("{operation}: transient failure: {message}")]
    Transient {
        /// Operation attempted
        operation: String,
        /// Provider message
        message: String,
    },
    /// Anything else
    #[error("{operation}: {message}")]
    Other {
        /// Operation attempted
        operation: String,
        /// Provider message
        message: String,
    },
}

impl StoreError {
    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a condition-failed error
    pub fn condition_failed(what: impl Into<String>) -> Self {
        Self::ConditionFailed { what: what.into() }
    }

    /// Create a transient error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an access-denied error
    pub fn access_denied(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessDenied {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Classify an S3 or DynamoDB error code
    ///
    /// `what` names the object for not-found and condition errors. Creating
    /// something that already exists reads as a failed condition.
    pub fn from_code(operation: &str, code: &str, what: &str, message: &str) -> Self {
        match code {
            "NoSuchBucket" | "NoSuchKey" | "NotFound" | "ResourceNotFoundException" => {
                Self::not_found(what)
            }
            "ConditionalCheckFailedException" | "PreconditionFailed"
            | "ConditionalRequestConflict" | "BucketAlreadyOwnedByYou" | "BucketAlreadyExists"
            | "ResourceInUseException" | "TransactionConflictException" => {
                Self::condition_failed(what)
            }
            "AccessDenied" | "AccessDeniedException" | "Forbidden" | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch" | "UnrecognizedClientException" => {
                Self::access_denied(operation, message)
            }
            "SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout"
            | "InternalError" | "InternalServerError" | "ServiceUnavailable"
            | "ProvisionedThroughputExceededException" | "RequestLimitExceeded" => {
                Self::transient(operation, message)
            }
            _ => Self::other(operation, format!("{}: {}", code, message)),
        }
    }

    /// Create an uncategorized error
    pub fn other(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Other {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

const STORE_PROVIDER: &str = "state";

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { what } => Error::not_found("state object", what),
            StoreError::ConditionFailed { what } => {
                Error::conflict(what, "conditional write rejected")
            }
            StoreError::Transient { operation, message } => {
                Error::provider_transient(STORE_PROVIDER, operation, message)
            }
            StoreError::AccessDenied { operation, message } => Error::provider_fatal(
                STORE_PROVIDER,
                operation,
                format!("access denied: {}", message),
            ),
            StoreError::Other { operation, message } => {
                Error::provider_fatal(STORE_PROVIDER, operation, message)
            }
        }
    }
}

/// Result type for the storage seams
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// =============================================================================
// Object store
// =============================================================================

/// Server-side encryption applied to new objects
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    /// Provider-managed keys
    Aes256,
    /// Customer-managed key
    Kms {
        /// Key id or ARN
        key_id: String,
    },
}

impl Encryption {
    /// Algorithm name as the provider spells it
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Aes256 => "AES256",
            Self::Kms { .. } => "aws:kms",
        }
    }
}

/// One bucket lifecycle rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    /// Rule id
    pub id: String,
    /// Days after which noncurrent versions expire
    pub noncurrent_version_expiration_days: Option<u32>,
    /// Days after which incomplete multipart uploads are aborted
    pub abort_incomplete_multipart_days: Option<u32>,
}

/// Versioned blob store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Succeeds if the bucket exists and is reachable
    async fn head_bucket(&self, bucket: &str) -> StoreResult<()>;
    /// Create a bucket in a region
    async fn create_bucket(&self, bucket: &str, region: &str) -> StoreResult<()>;
    /// Block every form of public access
    async fn put_public_access_block(&self, bucket: &str) -> StoreResult<()>;
    /// Enable or suspend object versioning
    async fn put_bucket_versioning(&self, bucket: &str, enabled: bool) -> StoreResult<()>;
    /// Set default server-side encryption
    async fn put_bucket_encryption(&self, bucket: &str, encryption: &Encryption) -> StoreResult<()>;
    /// Replace the lifecycle configuration
    async fn put_bucket_lifecycle(&self, bucket: &str, rules: &[LifecycleRule]) -> StoreResult<()>;
    /// Replace the bucket tags
    async fn put_bucket_tagging(
        &self,
        bucket: &str,
        tags: &BTreeMap<String, String>,
    ) -> StoreResult<()>;
    /// Write an object, returning the new version id
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> StoreResult<String>;
    /// Read the current version of an object
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Vec<u8>>;
    /// Succeeds if the object exists
    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<()>;
    /// Delete the current version of an object
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;
    /// Keys under a prefix
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>>;
}

// =============================================================================
// Lock table
// =============================================================================

/// Table lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    /// Being created
    Creating,
    /// Usable
    Active,
    /// Being removed
    Deleting,
}

/// Lock table definition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name
    pub name: String,
    /// String partition key attribute
    pub hash_key: String,
    /// Pay-per-request billing
    pub on_demand: bool,
    /// Server-side encryption
    pub sse_enabled: bool,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

/// Condition attached to a lock delete
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteCondition {
    /// Delete regardless of content
    Always,
    /// Delete only if the stored `Info` equals this value
    InfoEquals(String),
}

/// Strongly-consistent table with conditional writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Current status; `NotFound` if the table does not exist
    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus>;
    /// Create a table
    async fn create_table(&self, spec: &TableSpec) -> StoreResult<()>;
    /// Turn on point-in-time recovery
    async fn enable_point_in_time_recovery(&self, table: &str) -> StoreResult<()>;
    /// Insert a record only if no record with its id exists
    ///
    /// Fails with `ConditionFailed` when one does.
    async fn put_if_absent(&self, table: &str, record: LockRecord) -> StoreResult<()>;
    /// Read a record
    async fn get(&self, table: &str, lock_id: &str) -> StoreResult<Option<LockRecord>>;
    /// Delete a record under a condition
    ///
    /// Missing records are not an error. A present record that fails the
    /// condition yields `ConditionFailed`.
    async fn delete(
        &self,
        table: &str,
        lock_id: &str,
        condition: DeleteCondition,
    ) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::ErrorKind;

    #[test]
    fn store_errors_map_onto_the_error_taxonomy() {
        let cases = [
            (StoreError::not_found("clusters/t1/state.json"), ErrorKind::NotFound),
            (StoreError::condition_failed("locks/t1"), ErrorKind::Conflict),
            (StoreError::transient("GetObject", "SlowDown"), ErrorKind::ProviderTransient),
            (StoreError::access_denied("PutObject", "403"), ErrorKind::ProviderFatal),
            (StoreError::other("CreateBucket", "boom"), ErrorKind::ProviderFatal),
        ];
        for (store_err, kind) in cases {
            assert_eq!(Error::from(store_err).kind(), kind);
        }
    }

    #[rstest::rstest]
    #[case("GetObject", "NoSuchKey", ErrorKind::NotFound)]
    #[case("HeadBucket", "NotFound", ErrorKind::NotFound)]
    #[case("DescribeTable", "ResourceNotFoundException", ErrorKind::NotFound)]
    #[case("PutItem", "ConditionalCheckFailedException", ErrorKind::Conflict)]
    #[case("CreateBucket", "BucketAlreadyOwnedByYou", ErrorKind::Conflict)]
    #[case("CreateTable", "ResourceInUseException", ErrorKind::Conflict)]
    #[case("PutObject", "SlowDown", ErrorKind::ProviderTransient)]
    #[case("GetItem", "ProvisionedThroughputExceededException", ErrorKind::ProviderTransient)]
    #[case("PutObject", "AccessDenied", ErrorKind::ProviderFatal)]
    #[case("PutBucketTagging", "MalformedXML", ErrorKind::ProviderFatal)]
    fn provider_codes_map_onto_the_error_taxonomy(
        #[case] operation: &str,
        #[case] code: &str,
        #[case] kind: ErrorKind,
    ) {
        let store_err = StoreError::from_code(operation, code, "clusters/t1/state.json", "boom");
        assert_eq!(Error::from(store_err).kind(), kind);
    }

    #[test]
    fn only_transient_store_errors_are_retryable() {
        assert!(Error::from(StoreError::transient("GetObject", "timeout")).is_retryable());
        assert!(!Error::from(StoreError::access_denied("GetObject", "403")).is_retryable());
    }

    #[test]
    fn encryption_algorithm_names() {
        assert_eq!(Encryption::Aes256.algorithm(), "AES256");
        let kms = Encryption::Kms {
            key_id: "alias/strata".into(),
        };
        assert_eq!(kms.algorithm(), "aws:kms");
    }
}
