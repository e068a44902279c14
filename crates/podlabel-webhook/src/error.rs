use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use podlabel_core::PodLabelError;
use serde_json::json;
use thiserror::Error;

/// Failures that prevent an admission decision from being made at all.
///
/// A policy rejection is not an error: it is a normal `allowed: false`
/// review with HTTP 200.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Malformed envelope or embedded object (400)
    #[error("invalid admission request: {0}")]
    InvalidRequest(String),

    /// Object under admission is not a Pod (400)
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    /// Body is not JSON (415)
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Response could not be produced (500)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for admission handlers
pub type Result<T> = std::result::Result<T, AdmissionError>;

impl AdmissionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::InvalidRequest(_) | AdmissionError::UnsupportedKind(_) => {
                StatusCode::BAD_REQUEST
            }
            AdmissionError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error_response(status, self.to_string())
    }
}

/// Status-shaped JSON error body
pub fn error_response(status: StatusCode, message: String) -> Response {
    let body = Json(json!({
        "apiVersion": "v1",
        "kind": "Status",
        "status": "Failure",
        "message": message,
        "code": status.as_u16()
    }));

    (status, body).into_response()
}

impl From<PodLabelError> for AdmissionError {
    fn from(err: PodLabelError) -> Self {
        match err {
            PodLabelError::UnsupportedKind { .. } => {
                AdmissionError::UnsupportedKind(err.to_string())
            }
            e if e.is_client_error() => AdmissionError::InvalidRequest(e.to_string()),
            e => AdmissionError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AdmissionError::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AdmissionError::UnsupportedKind("Node".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AdmissionError::UnsupportedMediaType("text/plain".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            AdmissionError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_core_error_mapping() {
        let err: AdmissionError = PodLabelError::unsupported_kind("Deployment").into();
        assert!(matches!(err, AdmissionError::UnsupportedKind(_)));

        let err: AdmissionError = PodLabelError::invalid_request("empty").into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err: AdmissionError = PodLabelError::validation("pod", "podIP", "wait").into();
        assert!(matches!(err, AdmissionError::InvalidRequest(_)));

        let err: AdmissionError = PodLabelError::patch_failed("bad").into();
        assert!(matches!(err, AdmissionError::Internal(_)));
    }
}
