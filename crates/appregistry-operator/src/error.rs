//! Error types for the app-registry operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error (transport, validation, anything not classified below)
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Create lost a race against another writer
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Update rejected because the resource version is stale
    #[error("Conflict updating {kind}/{name} in namespace {namespace}")]
    Conflict {
        kind: String,
        name: String,
        namespace: String,
    },

    /// No source is known to provide the package
    #[error("Package not found in any source: {0}")]
    PackageNotFound(String),

    /// Required object metadata is missing
    #[error("Missing object key: {0}")]
    MissingField(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Conflict { .. }
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Fixed requeue delay for errors that should not back off.
    ///
    /// `None` means the caller applies its exponential backoff.
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self {
            // Stale resource version: the next read will see the winner's write
            OperatorError::Conflict { .. } => Some(std::time::Duration::from_secs(5)),
            _ => None,
        }
    }

    /// True when a create found the object already present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::AlreadyExists { .. })
    }
}
