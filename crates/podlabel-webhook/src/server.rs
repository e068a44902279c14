use crate::admission::{mutate_pod_creation, validate_pod_status};
use crate::error::error_response;
use crate::state::WebhookState;
use crate::tls::{files_readable, resolve_tls, TlsMode};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use miette::{Context, IntoDiagnostic};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Webhook listener configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Upper bound on handling a single request
    pub request_timeout: Duration,
    pub tls: TlsMode,
    /// Time allowed for in-flight requests to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            request_timeout: Duration::from_secs(10),
            tls: TlsMode::from_cert_dir("/certs"),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Admission webhook server
pub struct WebhookServer {
    config: WebhookConfig,
    state: Arc<WebhookState>,
}

impl WebhookServer {
    pub fn new(config: WebhookConfig, state: WebhookState) -> Self {
        let state = match config.tls.file_paths() {
            Some((cert, key)) => state.with_tls_files(cert, key),
            None => state,
        };
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<WebhookState> {
        self.state.clone()
    }

    /// Serve until the token is cancelled
    pub async fn run(self, token: CancellationToken) -> miette::Result<()> {
        let material = resolve_tls(&self.config.tls)?;
        let app = build_router(self.state.clone(), self.config.request_timeout);
        let addr = self.config.listen_addr;

        match material {
            Some(material) => {
                if let Some(ca_path) = &material.ca_path {
                    info!(
                        "Using generated webhook CA {}; register it as the caBundle of the webhook configuration",
                        ca_path.display()
                    );
                }
                let tls_config = RustlsConfig::from_pem(material.cert_pem, material.key_pem)
                    .await
                    .into_diagnostic()
                    .wrap_err("invalid webhook TLS material")?;

                let handle = axum_server::Handle::new();
                let shutdown_handle = handle.clone();
                let grace = self.config.shutdown_grace;
                let shutdown_token = token.clone();
                tokio::spawn(async move {
                    shutdown_token.cancelled().await;
                    shutdown_handle.graceful_shutdown(Some(grace));
                });

                let ready_handle = handle.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    if let Some(bound) = ready_handle.listening().await {
                        info!("Admission webhook listening on https://{}", bound);
                        state.set_ready(true);
                    }
                });

                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .into_diagnostic()
                    .wrap_err_with(|| format!("webhook server on {} failed", addr))?;
            }
            None => {
                let listener = TcpListener::bind(addr)
                    .await
                    .into_diagnostic()
                    .wrap_err_with(|| format!("failed to bind {}", addr))?;
                info!("Admission webhook listening on http://{} (TLS disabled)", addr);
                self.state.set_ready(true);

                axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                    .into_diagnostic()
                    .wrap_err_with(|| format!("webhook server on {} failed", addr))?;
            }
        }

        self.state.set_ready(false);
        info!("Admission webhook stopped");
        Ok(())
    }
}

/// Build the router with every route and the request middleware
pub fn build_router(state: Arc<WebhookState>, request_timeout: Duration) -> Router {
    let routes = Router::new()
        .route("/mutate-pod-creation", post(mutate_pod_creation))
        .route("/validate-pod-status", post(validate_pod_status))
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state);

    with_middleware(routes, request_timeout)
}

fn with_middleware(router: Router, request_timeout: Duration) -> Router {
    router
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Recovered from panic in request handler");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error while handling admission request".to_string(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

/// Liveness: the serving certificate must still be readable
async fn livez(State(state): State<Arc<WebhookState>>) -> Response {
    match &state.tls_files {
        Some((cert, key)) if !files_readable(cert, key) => {
            (StatusCode::SERVICE_UNAVAILABLE, "tls files unreadable").into_response()
        }
        _ => "ok".into_response(),
    }
}

/// Readiness: the listener is bound
async fn readyz(State(state): State<Arc<WebhookState>>) -> Response {
    if state.is_ready() {
        "ok".into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}
