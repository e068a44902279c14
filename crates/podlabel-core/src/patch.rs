//! Minimal JSON patches between current and desired labels.

use crate::error::{PodLabelError, Result};
use crate::labels::{DesiredLabelSet, MANAGED_LABELS, MISSING_VALUES_LABEL};
use crate::types::Labels;
use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use serde_json::{json, Value};

/// Patch type tag carried in admission responses
pub const JSON_PATCH_TYPE: &str = "JSONPatch";

/// Pointer to the label container, `/metadata/labels`
pub fn labels_pointer() -> PointerBuf {
    PointerBuf::from_tokens(["metadata", "labels"])
}

/// Pointer to a single label; keys containing `/` or `~` are escaped
pub fn label_pointer(key: &str) -> PointerBuf {
    PointerBuf::from_tokens(["metadata", "labels", key])
}

/// Compute the ordered operations that move `current` to `desired`.
///
/// `current == None` means the object has no label container, in which case
/// the container is created first. Only managed keys are ever touched, and
/// `missingLabelsValues` is removed rather than flipped to `"false"`.
pub fn diff_labels(current: Option<&Labels>, desired: &DesiredLabelSet) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    let empty = Labels::new();

    let current = match current {
        Some(labels) => labels,
        None => {
            ops.push(PatchOperation::Add(AddOperation {
                path: labels_pointer(),
                value: json!({}),
            }));
            &empty
        }
    };

    for key in MANAGED_LABELS {
        match (current.get(key), desired.get(key)) {
            (None, Some(value)) => ops.push(PatchOperation::Add(AddOperation {
                path: label_pointer(key),
                value: Value::String(value.to_string()),
            })),
            (Some(existing), Some(value)) if existing != value => {
                ops.push(PatchOperation::Replace(ReplaceOperation {
                    path: label_pointer(key),
                    value: Value::String(value.to_string()),
                }))
            }
            (Some(_), None) if key == MISSING_VALUES_LABEL => {
                ops.push(PatchOperation::Remove(RemoveOperation {
                    path: label_pointer(key),
                }))
            }
            _ => {}
        }
    }

    ops
}

/// Apply label operations to a label map and return the resulting labels.
///
/// The operations are applied to a `{"metadata":{"labels":…}}` document, the
/// same shape the admission patch targets.
pub fn apply_label_patch(current: Option<&Labels>, ops: &[PatchOperation]) -> Result<Labels> {
    let mut doc = json!({ "metadata": {} });
    if let Some(labels) = current {
        doc["metadata"]["labels"] = serde_json::to_value(labels).map_err(|e| {
            PodLabelError::serialization(
                format!("Failed to encode labels: {}", e),
                Some(Box::new(e)),
            )
        })?;
    }

    json_patch::patch(&mut doc, ops).map_err(|e| PodLabelError::patch_failed(e.to_string()))?;

    match doc.pointer("/metadata/labels") {
        Some(labels) => serde_json::from_value(labels.clone()).map_err(|e| {
            PodLabelError::serialization(
                format!("Patched labels are not a string map: {}", e),
                Some(Box::new(e)),
            )
        }),
        None => Ok(Labels::new()),
    }
}

/// Full label map after converging `current` to `desired`, or `None` when
/// nothing needs to change.
pub fn converged_labels(
    current: Option<&Labels>,
    desired: &DesiredLabelSet,
) -> Result<Option<Labels>> {
    let ops = diff_labels(current, desired);
    if ops.is_empty() {
        return Ok(None);
    }
    apply_label_patch(current, &ops).map(Some)
}

/// Serialize operations as an RFC 6902 patch document
pub fn render_patch(ops: &[PatchOperation]) -> Result<Vec<u8>> {
    serde_json::to_vec(ops).map_err(|e| {
        PodLabelError::serialization(format!("Failed to encode patch: {}", e), Some(Box::new(e)))
    })
}
