use crate::error::{ControllerError, Result};
use crate::traits::{PodEvent, PodEventStream, PodStore, WatchEventType};
use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use podlabel_core::{Labels, ObjectSnapshot, PodKey, ResourceVersion};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Where the kubelet mounts the pod's service-account credentials
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const TOKEN_FILE: &str = "token";
const CA_FILE: &str = "ca.crt";

/// Lightweight HTTP client for the convergence paths to talk to the API server
pub struct ApiClient {
    base_url: String,
    client: Client,
}

/// Watch frame as sent by the API server (SSE `data:` payload or a JSON line)
#[derive(Debug, Clone, Deserialize)]
struct WatchFrame {
    #[serde(rename = "type")]
    event_type: WatchEventType,
    #[serde(default)]
    object: serde_json::Value,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: &str, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Client authenticated with the service account mounted at `sa_dir`.
    ///
    /// Sends the account's bearer token on every request and trusts the
    /// cluster CA alongside the system roots.
    // TODO: re-read the projected token when the kubelet rotates it
    pub fn from_service_account(base_url: &str, sa_dir: &Path) -> Result<Self> {
        let token_path = sa_dir.join(TOKEN_FILE);
        let token = std::fs::read_to_string(&token_path).map_err(|e| {
            ControllerError::invalid_config(
                format!("failed to read service account token {}: {}", token_path.display(), e),
                "Mount a service account token or pass --api-url for an unauthenticated endpoint",
            )
        })?;

        let ca_path = sa_dir.join(CA_FILE);
        let ca_pem = std::fs::read(&ca_path).map_err(|e| {
            ControllerError::invalid_config(
                format!("failed to read cluster CA {}: {}", ca_path.display(), e),
                "Check that the service account volume includes ca.crt",
            )
        })?;
        let ca = Certificate::from_pem(&ca_pem).map_err(|e| {
            ControllerError::invalid_config(
                format!("invalid cluster CA {}: {}", ca_path.display(), e),
                "ca.crt must hold a PEM-encoded certificate",
            )
        })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim())).map_err(|_| {
            ControllerError::invalid_config(
                format!("service account token {} is not a valid header value", token_path.display()),
                "The token file must hold a single bearer token",
            )
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .add_root_certificate(ca)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                ControllerError::invalid_config(
                    format!("failed to build cluster client: {}", e),
                    "Check the cluster CA certificate",
                )
            })?;

        info!("Using service account credentials from {}", sa_dir.display());
        Ok(Self::with_client(base_url, client))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pod_url(&self, key: &PodKey) -> String {
        format!("{}/{}", self.base_url, key.api_path())
    }

    /// GET /api/v1/namespaces/{namespace}/pods/{name}
    pub async fn get_pod(&self, key: &PodKey) -> Result<Option<Pod>> {
        let url = self.pod_url(key);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ControllerError::transient(format!("HTTP request failed: {}", e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(key, None, status, &body));
        }

        resp.json::<Pod>()
            .await
            .map(Some)
            .map_err(|e| ControllerError::transient(format!("Failed to parse pod: {}", e)))
    }

    /// PUT /api/v1/namespaces/{namespace}/pods/{name}
    ///
    /// The pod must carry the `resourceVersion` it was read at; the server
    /// rejects stale writes with 409.
    pub async fn replace_pod(&self, key: &PodKey, pod: &Pod) -> Result<Pod> {
        let url = self.pod_url(key);
        debug!("PUT {}", url);

        let resp = self
            .client
            .put(&url)
            .json(pod)
            .send()
            .await
            .map_err(|e| ControllerError::transient(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let version = pod.metadata.resource_version.as_deref();
            return Err(status_error(key, version, status, &body));
        }

        resp.json::<Pod>()
            .await
            .map_err(|e| ControllerError::transient(format!("Failed to parse pod: {}", e)))
    }
}

#[async_trait]
impl PodStore for ApiClient {
    async fn get(&self, key: &PodKey) -> Result<Option<ObjectSnapshot>> {
        Ok(self.get_pod(key).await?.as_ref().map(ObjectSnapshot::from_pod))
    }

    async fn update_labels(
        &self,
        key: &PodKey,
        version: &ResourceVersion,
        labels: &Labels,
    ) -> Result<ResourceVersion> {
        // The API only supports whole-object writes; re-read to carry the
        // rest of the object, and refuse early if it has already moved on.
        let mut pod = self
            .get_pod(key)
            .await?
            .ok_or_else(|| ControllerError::not_found(key.to_string()))?;

        if pod.metadata.resource_version.as_deref() != Some(version.as_str()) {
            return Err(ControllerError::conflict(key.to_string(), version.as_str()));
        }

        pod.metadata.labels = Some(labels.clone());
        let updated = self.replace_pod(key, &pod).await?;

        updated
            .metadata
            .resource_version
            .map(ResourceVersion::new)
            .ok_or_else(|| ControllerError::transient("Updated pod carries no resourceVersion"))
    }

    /// GET /api/v1/pods?watch=true
    async fn watch(&self) -> Result<PodEventStream> {
        let url = format!("{}/api/v1/pods?watch=true", self.base_url);
        debug!("WATCH {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ControllerError::transient(format!("Watch request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ControllerError::transient(format!(
                "Watch request failed with status {}",
                resp.status()
            )));
        }

        let chunks = resp.bytes_stream().boxed();
        let events = futures_util::stream::unfold(
            (chunks, Vec::<u8>::new()),
            |(mut chunks, mut buf)| async move {
                loop {
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        if let Some(item) = parse_watch_line(&line) {
                            return Some((item, (chunks, buf)));
                        }
                        continue;
                    }

                    match chunks.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            let err =
                                ControllerError::transient(format!("Watch stream failed: {}", e));
                            return Some((Err(err), (chunks, buf)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}

/// API server address advertised to every pod, if running inside a cluster
pub fn in_cluster_url() -> Option<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").ok()?;
    service_url(&host, &port)
}

fn service_url(host: &str, port: &str) -> Option<String> {
    let (host, port) = (host.trim(), port.trim());
    if host.is_empty() || port.is_empty() {
        return None;
    }
    if host.contains(':') {
        Some(format!("https://[{}]:{}", host, port))
    } else {
        Some(format!("https://{}:{}", host, port))
    }
}

/// Map a non-success HTTP status to the store error taxonomy
fn status_error(
    key: &PodKey,
    version: Option<&str>,
    status: StatusCode,
    body: &str,
) -> ControllerError {
    match status {
        StatusCode::NOT_FOUND => ControllerError::not_found(key.to_string()),
        StatusCode::CONFLICT => {
            ControllerError::conflict(key.to_string(), version.unwrap_or("<none>"))
        }
        _ => ControllerError::transient(format!(
            "Request for pod {} failed with status {}: {}",
            key, status, body
        )),
    }
}

/// Decode one line of a watch response.
///
/// Accepts SSE framing (`data: {...}`) as well as newline-delimited JSON.
/// Returns `None` for blank lines, SSE comments and other SSE fields, and
/// frames whose object has no name.
fn parse_watch_line(line: &[u8]) -> Option<Result<PodEvent>> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() || text.starts_with(':') {
        return None;
    }

    let payload = match text.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if text.starts_with('{') => text,
        None => return None,
    };

    let frame: WatchFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Skipping undecodable watch frame: {}", e);
            return None;
        }
    };

    if frame.event_type == WatchEventType::Error {
        return Some(Err(ControllerError::transient(format!(
            "Watch returned an error frame: {}",
            frame.object
        ))));
    }

    let metadata = &frame.object["metadata"];
    let key = PodKey::from_parts(metadata["namespace"].as_str(), metadata["name"].as_str())?;
    Some(Ok(PodEvent::new(frame.event_type, key)))
}
