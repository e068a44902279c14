// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for label computation and admission decoding
#[derive(Error, Debug, Diagnostic)]
pub enum PodLabelError {
    /// Request body could not be decoded
    #[error("Invalid admission request: {reason}")]
    #[diagnostic(
        code(podlabel::invalid_request),
        help("Send a non-empty admission.k8s.io/v1 AdmissionReview with a populated `request` field")
    )]
    InvalidRequest {
        #[allow(unused)]
        reason: String,
    },

    /// Object kind is not handled
    #[error("Unsupported object kind: {kind}")]
    #[diagnostic(
        code(podlabel::unsupported_kind),
        help("Only Pod objects are handled. Narrow the webhook rules to pods")
    )]
    UnsupportedKind {
        #[allow(unused)]
        kind: String,
    },

    /// Required attribute missing
    #[error("Validation failed for {resource}: {details}")]
    #[diagnostic(code(podlabel::validation_failed), help("{help_text}"))]
    Validation {
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        details: String,
        #[allow(unused)]
        help_text: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(podlabel::serialization_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    Serialization {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Patch could not be applied to a label document
    #[error("Failed to apply label patch: {message}")]
    #[diagnostic(
        code(podlabel::patch_failed),
        help("The patch was generated against a different label set than the one it was applied to")
    )]
    PatchFailed {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, PodLabelError>;

impl PodLabelError {
    /// Create an InvalidRequest error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedKind error
    pub fn unsupported_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedKind { kind: kind.into() }
    }

    /// Create a Validation error
    pub fn validation(
        resource: impl Into<String>,
        details: impl Into<String>,
        help_text: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            details: details.into(),
            help_text: help_text.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source,
        }
    }

    pub fn patch_failed(message: impl Into<String>) -> Self {
        Self::PatchFailed {
            message: message.into(),
        }
    }

    /// Whether the error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. } | Self::UnsupportedKind { .. } | Self::Validation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PodLabelError::unsupported_kind("Deployment");
        assert!(matches!(err, PodLabelError::UnsupportedKind { .. }));
        assert_eq!(err.to_string(), "Unsupported object kind: Deployment");

        let err = PodLabelError::validation(
            "Pod",
            "ipAddress is not assigned",
            "Wait for the pod to be scheduled",
        );
        assert!(matches!(err, PodLabelError::Validation { .. }));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(PodLabelError::invalid_request("empty body").is_client_error());
        assert!(PodLabelError::unsupported_kind("Service").is_client_error());
        assert!(PodLabelError::validation("Pod", "podIP", "wait").is_client_error());
        assert!(!PodLabelError::serialization("boom", None).is_client_error());
        assert!(!PodLabelError::patch_failed("bad path").is_client_error());
    }
}
