//! Error types for the gateway operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// An update carried a stale resourceVersion
    #[error("Conflict writing {kind}/{name}: object was modified")]
    Conflict { kind: String, name: String },

    /// A create raced with another create of the same name
    #[error("{kind}/{name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

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

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn not_found(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<&str>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.unwrap_or("<cluster>").to_string(),
        }
    }

    /// Stale resourceVersion, create races and API errors resolve themselves on a fresh read
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OperatorError::Conflict { .. } | OperatorError::AlreadyExists { .. }
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
            || matches!(
                self,
                OperatorError::KubeError(_)
                    | OperatorError::ReconcileFailed(_)
                    | OperatorError::FinalizerError(_)
            )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        if self.is_transient() {
            Some(Duration::from_secs(1))
        } else if self.is_retryable() {
            Some(Duration::from_secs(30))
        } else {
            None
        }
    }
}
