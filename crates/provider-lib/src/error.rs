//! Error types for provider operations

use thiserror::Error;

/// Result alias used throughout the provider library
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for provider operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A remote resource is missing mandatory fields
    #[error("validation error: {0}")]
    Validation(String),

    /// The container group is tagged for a different virtual node
    #[error("container group {name} belongs to node {actual:?}, expected {expected}")]
    NodeMismatch {
        name: String,
        expected: String,
        actual: Option<String>,
    },

    /// Required inputs for an operation are not available
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation is not valid for the current state of the pod
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Network or remote call failure
    #[error("remote call failed{}: {message}", status_suffix(.status))]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// The operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A spawned task panicked or was aborted unexpectedly
    #[error("task failed: {0}")]
    Task(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid state error with the given message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a transient error carrying the remote status code, if any
    pub fn transient(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Transient {
            status,
            message: msg.into(),
        }
    }

    /// Returns true for network or remote failures
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Returns true if the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// HTTP status reported by the remote side, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Transient { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
