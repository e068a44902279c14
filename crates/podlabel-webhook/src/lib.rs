//! Podlabel Webhook - Admission endpoints for pod labelling
//!
//! This crate provides:
//! - `admission.k8s.io/v1` review types
//! - Mutating (`/mutate-pod-creation`) and validating (`/validate-pod-status`) handlers
//! - Axum server with TLS from a mounted certificate directory
//! - Health probes

pub mod admission;
pub mod error;
pub mod review;
pub mod server;
pub mod state;
pub mod tls;

// Re-export commonly used types
pub use error::{AdmissionError, Result};
pub use review::{AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionStatus};
pub use server::{build_router, WebhookConfig, WebhookServer};
pub use state::{ValidationPolicy, WebhookState};
pub use tls::{resolve_tls, TlsMaterial, TlsMode};
