//! Error types for Strata operations
//!
//! Errors are structured with fields so an operator can tell which cluster,
//! resource or provider call failed. Every variant maps onto one [`ErrorKind`],
//! which is what callers branch on (retry, surface, aggregate).

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Failure category used by callers to decide how to react
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid desired state; nothing was touched
    Configuration,
    /// Lock already held, or the cluster already exists
    Conflict,
    /// Load/delete against absent state
    NotFound,
    /// Network or throttling failure; safe to retry
    ProviderTransient,
    /// Permission, quota or validation failure; not retried
    ProviderFatal,
    /// A bounded wait expired
    Timeout,
    /// Teardown completed some but not all resource classes
    PartialFailure,
    /// Local I/O, encoding or internal failure
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Conflict => "conflict",
            Self::NotFound => "not-found",
            Self::ProviderTransient => "provider-transient",
            Self::ProviderFatal => "provider-fatal",
            Self::Timeout => "timeout",
            Self::PartialFailure => "partial-failure",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Main error type for Strata operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid cluster configuration, rejected before any resource is touched
    #[error("configuration error for {cluster}: {message}")]
    Configuration {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Offending field path (e.g. "node.desiredSize")
        field: Option<String>,
        /// Description of what's invalid
        message: String,
    },

    /// Another operation holds the lock, or the cluster already exists
    #[error("conflict on {cluster}: {message}")]
    Conflict {
        /// Cluster name the conflict is about
        cluster: String,
        /// Description of the conflict
        message: String,
    },

    /// The requested record does not exist
    #[error("{resource} not found: {name}")]
    NotFound {
        /// Kind of record (e.g. "cluster state", "role")
        resource: String,
        /// Name or id that was looked up
        name: String,
    },

    /// Retryable provider failure (throttling, connection reset, 5xx)
    #[error("transient provider error [{provider}] during {operation}: {message}")]
    ProviderTransient {
        /// Provider or service name (e.g. "aws/ec2", "s3")
        provider: String,
        /// API operation that failed
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Non-retryable provider failure (permissions, quota, validation)
    #[error("provider error [{provider}] during {operation}: {message}")]
    ProviderFatal {
        /// Provider or service name
        provider: String,
        /// API operation that failed
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait expired
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// How long the wait lasted
        after: Duration,
    },

    /// Teardown left some resource classes behind
    #[error("teardown of {cluster} incomplete; failed: {}", .failed.join(", "))]
    PartialFailure {
        /// Cluster being torn down
        cluster: String,
        /// Resources that could not be removed
        failed: Vec<String>,
    },

    /// Cluster creation stopped on an unrecoverable error
    ///
    /// Carries the resources created so far. Nothing is rolled back.
    #[error(
        "creating {cluster} failed during {stage}: {source}; run destroy against '{cluster}' \
         to reclaim partially-created resources"
    )]
    CreateFailed {
        /// Cluster being created
        cluster: String,
        /// Stage that failed (e.g. "iam", "network", "cluster")
        stage: String,
        /// Underlying error
        source: Box<Error>,
        /// Resource graph created before the failure
        partial_resources: serde_json::Value,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Local filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being done (usually a path)
        context: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a configuration error without cluster context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            cluster: UNKNOWN_CONTEXT.to_string(),
            field: None,
            message: msg.into(),
        }
    }

    /// Create a configuration error for a specific cluster field
    pub fn configuration_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            field: Some(field.into()),
            message: msg.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create a retryable provider error
    pub fn provider_transient(
        provider: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ProviderTransient {
            provider: provider.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a non-retryable provider error
    pub fn provider_fatal(
        provider: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ProviderFatal {
            provider: provider.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Wrap a create-stage failure together with the resources created so far
    pub fn create_failed(
        cluster: impl Into<String>,
        stage: impl Into<String>,
        source: Error,
        partial_resources: serde_json::Value,
    ) -> Self {
        Self::CreateFailed {
            cluster: cluster.into(),
            stage: stage.into(),
            source: Box::new(source),
            partial_resources,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Failure category of this error
    ///
    /// `CreateFailed` reports the category of the error it wraps.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ProviderTransient { .. } => ErrorKind::ProviderTransient,
            Self::ProviderFatal { .. } => ErrorKind::ProviderFatal,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::CreateFailed { source, .. } => source.kind(),
            Self::Serialization { .. } | Self::Io { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a caller may retry the failed call as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. })
    }

    /// Partial resource graph carried by a failed create, if any
    pub fn partial_resources(&self) -> Option<&serde_json::Value> {
        match self {
            Self::CreateFailed {
                partial_resources, ..
            } => Some(partial_resources),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
