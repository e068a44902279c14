//! Mutating and validating admission handlers for Pods

use crate::error::{AdmissionError, Result};
use crate::review::{AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionStatus};
pub use crate::review::INVALID_REASON;
use crate::state::WebhookState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::Json;
use podlabel_core::{
    compute_desired_labels, diff_labels, pod_from_value, ObjectSnapshot, PodKey, PodLabelError,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A decoded admission request for a Pod
struct PodAdmission {
    review: AdmissionReview,
    request: AdmissionRequest,
    snapshot: ObjectSnapshot,
}

impl PodAdmission {
    fn key(&self) -> Option<PodKey> {
        self.snapshot.key()
    }
}

/// POST /mutate-pod-creation
pub async fn mutate_pod_creation(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AdmissionReview>> {
    let started = Instant::now();
    let admission = decode(&headers, &body)?;
    let uid = admission.request.uid.clone();

    let desired = compute_desired_labels(&admission.snapshot);
    let ops = diff_labels(admission.snapshot.labels.as_ref(), &desired);

    let response = AdmissionResponse::allow(&uid).with_patch(&ops).map_err(|e| {
        error!(uid = %uid, error = %e, "Failed to encode label patch");
        AdmissionError::from(e)
    })?;

    let scheduled = !admission.snapshot.is_resolved()
        && match admission.key() {
            Some(key) => state.schedule_convergence(key),
            None => {
                warn!(uid = %uid, "Pod has no name, cannot track it for convergence");
                false
            }
        };

    info!(
        uid = %uid,
        namespace = %admission.snapshot.namespace,
        name = %admission.snapshot.name,
        patch_ops = ops.len(),
        pending = desired.is_pending(),
        scheduled,
        duration_ms = started.elapsed().as_millis() as u64,
        "Mutated pod labels"
    );

    Ok(Json(admission.review.respond(response)))
}

/// POST /validate-pod-status
pub async fn validate_pod_status(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AdmissionReview>> {
    let started = Instant::now();
    let admission = decode(&headers, &body)?;
    let uid = admission.request.uid.clone();
    let missing = admission.snapshot.missing_attributes();

    let response = if state.policy.require_placement && !missing.is_empty() {
        let err = placement_error(&admission, &missing);
        AdmissionResponse::deny(&uid, AdmissionStatus::from(&err))
    } else {
        if !missing.is_empty() {
            if let Some(key) = admission.key() {
                state.schedule_convergence(key);
            }
        }
        AdmissionResponse::allow(&uid)
    };

    info!(
        uid = %uid,
        namespace = %admission.snapshot.namespace,
        name = %admission.snapshot.name,
        allowed = response.allowed,
        missing = ?missing,
        duration_ms = started.elapsed().as_millis() as u64,
        "Validated pod placement"
    );

    Ok(Json(admission.review.respond(response)))
}

fn placement_error(admission: &PodAdmission, missing: &[&str]) -> PodLabelError {
    let resource = match admission.key() {
        Some(key) => format!("pod {}", key),
        None => "unnamed pod".to_string(),
    };
    PodLabelError::validation(
        resource,
        format!("missing required placement: {}", missing.join(", ")),
        "Retry once the pod is scheduled and has an address",
    )
}

/// Shared decode path for both endpoints
fn decode(headers: &HeaderMap, body: &[u8]) -> Result<PodAdmission> {
    require_json(headers)?;

    if body.is_empty() {
        return Err(AdmissionError::InvalidRequest("request body is empty".to_string()));
    }

    let mut review: AdmissionReview = serde_json::from_slice(body).map_err(|e| {
        AdmissionError::InvalidRequest(format!("failed to decode AdmissionReview: {}", e))
    })?;

    let request = review
        .request
        .take()
        .ok_or_else(|| AdmissionError::InvalidRequest("review has no request".to_string()))?;

    if request.kind.kind != "Pod" {
        return Err(podlabel_core::PodLabelError::unsupported_kind(&request.kind.kind).into());
    }

    let object = request
        .object
        .clone()
        .ok_or_else(|| AdmissionError::InvalidRequest("request has no object".to_string()))?;

    let mut pod = pod_from_value(object)?;

    // Objects at CREATE time may rely on the request for their identity
    if pod.metadata.name.as_deref().unwrap_or_default().is_empty() {
        pod.metadata.name = request.name.clone();
    }
    if pod.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        pod.metadata.namespace = request.namespace.clone();
    }
    let snapshot = ObjectSnapshot::from_pod(&pod);

    debug!(
        uid = %request.uid,
        operation = request.operation.as_deref().unwrap_or_default(),
        "Decoded pod admission request"
    );

    Ok(PodAdmission {
        review,
        request,
        snapshot,
    })
}

fn require_json(headers: &HeaderMap) -> Result<()> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if essence.eq_ignore_ascii_case("application/json") {
        Ok(())
    } else {
        Err(AdmissionError::UnsupportedMediaType(format!(
            "expected application/json, got '{}'",
            content_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    fn review(kind: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "uid-1",
                "kind": {"group": "", "version": "v1", "kind": kind},
                "namespace": "web",
                "operation": "CREATE",
                "object": object
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_require_json_accepts_charset() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(require_json(&headers).is_ok());

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(matches!(
            require_json(&headers),
            Err(AdmissionError::UnsupportedMediaType(_))
        ));
        assert!(require_json(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_decode_fills_namespace_from_request() {
        let body = review("Pod", json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "nginx"}}));
        let admission = decode(&json_headers(), &body).unwrap();
        assert_eq!(admission.key(), Some(PodKey::new("web", "nginx")));
        assert_eq!(admission.request.uid, "uid-1");
    }

    #[test]
    fn test_decode_rejects_other_kinds() {
        let body = review("Deployment", json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "nginx"}}));
        assert!(matches!(
            decode(&json_headers(), &body),
            Err(AdmissionError::UnsupportedKind(_))
        ));
    }

    #[test]
    fn test_decode_rejects_empty_and_malformed() {
        assert!(matches!(
            decode(&json_headers(), b""),
            Err(AdmissionError::InvalidRequest(_))
        ));
        assert!(matches!(
            decode(&json_headers(), b"{not json"),
            Err(AdmissionError::InvalidRequest(_))
        ));
        assert!(matches!(
            decode(&json_headers(), br#"{"apiVersion":"admission.k8s.io/v1","kind":"AdmissionReview"}"#),
            Err(AdmissionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_object() {
        let body = serde_json::to_vec(&json!({
            "request": {"uid": "u", "kind": {"kind": "Pod"}}
        }))
        .unwrap();
        assert!(matches!(
            decode(&json_headers(), &body),
            Err(AdmissionError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_placement_error_lists_missing_attributes() {
        let body = review("Pod", json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "nginx"}}));
        let admission = decode(&json_headers(), &body).unwrap();
        let missing = admission.snapshot.missing_attributes();

        let err = placement_error(&admission, &missing);
        assert!(matches!(err, PodLabelError::Validation { .. }));
        assert_eq!(
            err.to_string(),
            "Validation failed for pod web/nginx: missing required placement: podIP, nodeName"
        );
    }

    #[test]
    fn test_decode_rejects_malformed_pod() {
        let body = review("Pod", json!({"metadata": {"name": 7}}));
        assert!(matches!(
            decode(&json_headers(), &body),
            Err(AdmissionError::InvalidRequest(_))
        ));
    }
}
