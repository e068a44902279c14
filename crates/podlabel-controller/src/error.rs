use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Error type for cluster reads/writes and convergence work
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Optimistic-concurrency mismatch on write
    #[error("Conflict writing pod {pod}: version {version} is stale")]
    #[diagnostic(
        code(podlabel::controller::conflict),
        help("Another writer updated the pod after it was read. Re-fetch and recompute")
    )]
    Conflict {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        version: String,
    },

    /// Pod does not exist
    #[error("Pod not found: {pod}")]
    #[diagnostic(
        code(podlabel::controller::not_found),
        help("The pod was deleted or has not been persisted yet")
    )]
    NotFound {
        #[allow(unused)]
        pod: String,
    },

    /// Any other read/write failure against the cluster
    #[error("Cluster request failed: {message}")]
    #[diagnostic(
        code(podlabel::controller::transient),
        help("Check that the API server at --api-url is reachable. The request will be retried with backoff")
    )]
    Transient {
        #[allow(unused)]
        message: String,
    },

    /// Per-call deadline exceeded
    #[error("Operation '{operation}' exceeded its deadline of {timeout:?}")]
    #[diagnostic(
        code(podlabel::controller::timeout),
        help("The API server is slow to respond. The request will be retried with backoff")
    )]
    Timeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        timeout: Duration,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(podlabel::controller::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] podlabel_core::PodLabelError),
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn conflict(pod: impl Into<String>, version: impl Into<String>) -> Self {
        Self::Conflict {
            pod: pod.into(),
            version: version.into(),
        }
    }

    pub fn not_found(pod: impl Into<String>) -> Self {
        Self::NotFound { pod: pod.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Failures that a later attempt may succeed on
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Transient { .. } | Self::Timeout { .. }
        )
    }
}
