//! Podlabel Core - Desired-state computation for pod label convergence
//!
//! This crate provides:
//! - Read-only object snapshots built from Pods
//! - The single desired-label function shared by every write path
//! - Minimal, idempotent JSON patch generation against current labels
//! - Error types with miette diagnostics

pub mod error;
pub mod labels;
pub mod patch;
pub mod snapshot;
pub mod types;

// Re-export commonly used types
pub use error::{PodLabelError, Result};
pub use labels::{compute_desired_labels, DesiredLabelSet};
pub use patch::{apply_label_patch, converged_labels, diff_labels, render_patch, JSON_PATCH_TYPE};
pub use snapshot::ObjectSnapshot;
pub use types::{Labels, PodKey, ResourceVersion};

// Re-export k8s-openapi and json-patch types for convenience
pub use json_patch::PatchOperation;
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::Pod;

/// Deserialize a Pod from the raw object embedded in an admission request
pub fn pod_from_value(object: serde_json::Value) -> Result<Pod> {
    serde_json::from_value(object).map_err(|e| {
        PodLabelError::invalid_request(format!("Failed to decode pod object: {}", e))
    })
}
