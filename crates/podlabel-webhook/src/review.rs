//! `admission.k8s.io/v1` envelope types
//!
//! Only the fields the webhook reads or writes are modelled; everything else
//! in the request is ignored on decode.

use k8s_openapi::ByteString;
use podlabel_core::{render_patch, PatchOperation, PodLabelError, Result, JSON_PATCH_TYPE};
use serde::{Deserialize, Serialize};

pub const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
pub const ADMISSION_KIND: &str = "AdmissionReview";

/// Reason attached to placement-policy rejections
pub const INVALID_REASON: &str = "Invalid";

/// Group/version/kind of the object under admission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn default_api_version() -> String {
    ADMISSION_API_VERSION.to_string()
}

fn default_kind() -> String {
    ADMISSION_KIND.to_string()
}

impl AdmissionReview {
    /// Build the reply envelope, echoing the incoming `apiVersion`/`kind`
    pub fn respond(&self, response: AdmissionResponse) -> AdmissionReview {
        AdmissionReview {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            request: None,
            response: Some(response),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
}

/// Rejection details returned to the API server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub message: String,
    pub reason: String,
    pub code: u16,
}

impl From<&PodLabelError> for AdmissionStatus {
    fn from(err: &PodLabelError) -> Self {
        let (reason, code) = match err {
            PodLabelError::Validation { .. } => (INVALID_REASON, 422),
            e if e.is_client_error() => ("BadRequest", 400),
            _ => ("InternalError", 500),
        };
        Self {
            message: err.to_string(),
            reason: reason.to_string(),
            code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    /// RFC 6902 patch, base64-encoded on the wire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

impl AdmissionResponse {
    pub fn allow(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            patch: None,
            patch_type: None,
            status: None,
        }
    }

    pub fn deny(uid: impl Into<String>, status: AdmissionStatus) -> Self {
        Self {
            uid: uid.into(),
            allowed: false,
            patch: None,
            patch_type: None,
            status: Some(status),
        }
    }

    /// Attach a JSON patch. An empty operation list leaves the response unpatched.
    pub fn with_patch(mut self, ops: &[PatchOperation]) -> Result<Self> {
        if ops.is_empty() {
            return Ok(self);
        }
        self.patch = Some(ByteString(render_patch(ops)?));
        self.patch_type = Some(JSON_PATCH_TYPE.to_string());
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use json_patch::AddOperation;
    use podlabel_core::patch::labels_pointer;
    use serde_json::json;

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let review: AdmissionReview = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "web",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": {"metadata": {"name": "nginx"}}
            }
        }))
        .unwrap();

        let request = review.request.unwrap();
        assert_eq!(request.uid, "705ab4f5");
        assert_eq!(request.kind.kind, "Pod");
        assert_eq!(request.namespace.as_deref(), Some("web"));
        assert!(request.object.is_some());
    }

    #[test]
    fn test_patch_is_base64_with_type() {
        let ops = vec![PatchOperation::Add(AddOperation {
            path: labels_pointer(),
            value: json!({}),
        })];
        let response = AdmissionResponse::allow("abc").with_patch(&ops).unwrap();
        let wire = serde_json::to_value(&response).unwrap();

        assert_eq!(wire["patchType"], "JSONPatch");
        assert_eq!(
            wire["patch"],
            // [{"op":"add","path":"/metadata/labels","value":{}}]
            "W3sib3AiOiJhZGQiLCJwYXRoIjoiL21ldGFkYXRhL2xhYmVscyIsInZhbHVlIjp7fX1d"
        );
    }

    #[test]
    fn test_empty_patch_is_omitted() {
        let response = AdmissionResponse::allow("abc").with_patch(&[]).unwrap();
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire, json!({"uid": "abc", "allowed": true}));
    }

    #[test]
    fn test_respond_echoes_envelope() {
        let review = AdmissionReview {
            api_version: "admission.k8s.io/v1beta1".to_string(),
            kind: ADMISSION_KIND.to_string(),
            request: None,
            response: None,
        };
        let err = PodLabelError::validation("pod default/web", "podIP", "wait for scheduling");
        let deny = AdmissionResponse::deny("abc", AdmissionStatus::from(&err));
        let reply = serde_json::to_value(review.respond(deny)).unwrap();
        assert_eq!(reply["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(reply["response"]["allowed"], false);
        assert_eq!(reply["response"]["status"]["code"], 422);
        assert!(reply.get("request").is_none());
    }

    #[test]
    fn test_status_from_core_error() {
        let status = AdmissionStatus::from(&PodLabelError::validation(
            "pod web/nginx",
            "podIP, nodeName",
            "wait for scheduling",
        ));
        assert_eq!(status.reason, INVALID_REASON);
        assert_eq!(status.code, 422);
        assert_eq!(
            status.message,
            "Validation failed for pod web/nginx: podIP, nodeName"
        );

        let status = AdmissionStatus::from(&PodLabelError::unsupported_kind("Service"));
        assert_eq!((status.reason.as_str(), status.code), ("BadRequest", 400));

        let status = AdmissionStatus::from(&PodLabelError::patch_failed("bad path"));
        assert_eq!((status.reason.as_str(), status.code), ("InternalError", 500));
    }
}
