use clap::{Args, Parser, Subcommand, ValueEnum};
use podlabel_controller::{
    in_cluster_url, ApiClient, ConvergencePoller, PodController, PodControllerConfig, PodStore,
    PollerConfig, Reconciler, ReconcilerConfig, SERVICE_ACCOUNT_DIR,
};
use podlabel_webhook::{TlsMode, ValidationPolicy, WebhookConfig, WebhookServer, WebhookState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "podlabel", about = "Keeps pod placement labels converged")]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a filter directive
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the admission webhook and the pod controller
    Run {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        webhook: WebhookArgs,
        #[command(flatten)]
        poller: PollerArgs,
        #[command(flatten)]
        controller: ControllerArgs,
    },
    /// Run the admission webhook only
    Webhook {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        webhook: WebhookArgs,
        #[command(flatten)]
        poller: PollerArgs,
    },
    /// Run the pod controller only
    Controller {
        #[command(flatten)]
        cluster: ClusterArgs,
        #[command(flatten)]
        controller: ControllerArgs,
    },
}

const LOCAL_API_URL: &str = "http://127.0.0.1:6443";

#[derive(Args, Debug, Clone)]
struct ClusterArgs {
    /// Cluster API endpoint. Defaults to the in-cluster service address when
    /// running in a pod, otherwise to a local unauthenticated endpoint
    #[arg(long, env = "PODLABEL_API_URL")]
    api_url: Option<String>,
    /// Service account credentials used when running in a pod
    #[arg(long, default_value = SERVICE_ACCOUNT_DIR)]
    service_account_dir: PathBuf,
}

impl ClusterArgs {
    fn store(&self) -> miette::Result<Arc<dyn PodStore>> {
        Ok(Arc::new(self.client(in_cluster_url())?))
    }

    /// `in_cluster` is the API server address advertised to pods, if any
    fn client(&self, in_cluster: Option<String>) -> miette::Result<ApiClient> {
        match in_cluster {
            Some(service_url) => {
                let url = self.api_url.clone().unwrap_or(service_url);
                info!("Connecting to cluster API at {}", url);
                Ok(ApiClient::from_service_account(&url, &self.service_account_dir)?)
            }
            None => {
                let url = self.api_url.as_deref().unwrap_or(LOCAL_API_URL);
                info!("Connecting to cluster API at {} without credentials", url);
                Ok(ApiClient::new(url))
            }
        }
    }
}

#[derive(Args, Debug, Clone)]
struct WebhookArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8443")]
    bind: String,
    /// Directory holding tls.crt and tls.key
    #[arg(long, default_value = "/certs")]
    cert_dir: PathBuf,
    /// Serve plain HTTP (local testing only)
    #[arg(long, conflicts_with = "tls_auto_generate")]
    insecure: bool,
    /// Generate a self-signed certificate into --cert-dir if none exists
    #[arg(long)]
    tls_auto_generate: bool,
    /// Extra subject alternative names for generated certificates
    #[arg(long = "tls-san", default_values_t = vec!["localhost".to_string()])]
    tls_san: Vec<String>,
    /// Reject pods on the validating endpoint until address and host are assigned
    #[arg(long)]
    require_placement: bool,
    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    request_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
struct PollerArgs {
    #[arg(long, default_value_t = 500)]
    poll_initial_backoff_ms: u64,
    #[arg(long, default_value_t = 10_000)]
    poll_max_backoff_ms: u64,
    #[arg(long, default_value_t = 30)]
    poll_max_attempts: u32,
    #[arg(long, default_value_t = 300)]
    poll_deadline_secs: u64,
    /// Maximum concurrently tracked pods
    #[arg(long, default_value_t = 1024)]
    poll_max_tasks: usize,
    #[arg(long, default_value_t = 5)]
    poll_call_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Interval for re-reconciling every known pod
    #[arg(long, default_value_t = 300)]
    resync_secs: u64,
    /// Deadline for each cluster call made while reconciling
    #[arg(long, default_value_t = 10)]
    reconcile_timeout_secs: u64,
}

impl WebhookArgs {
    fn config(&self) -> miette::Result<WebhookConfig> {
        let listen_addr: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| miette::miette!("Invalid bind address '{}': {}", self.bind, e))?;

        let tls = if self.insecure {
            TlsMode::Disabled
        } else if self.tls_auto_generate {
            TlsMode::AutoGenerate {
                cert_dir: self.cert_dir.clone(),
                san_entries: self.tls_san.clone(),
            }
        } else {
            TlsMode::from_cert_dir(&self.cert_dir)
        };

        Ok(WebhookConfig {
            listen_addr,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            tls,
            ..WebhookConfig::default()
        })
    }

    fn policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            require_placement: self.require_placement,
        }
    }
}

impl PollerArgs {
    fn config(&self) -> miette::Result<PollerConfig> {
        if self.poll_max_attempts == 0 {
            return Err(miette::miette!("--poll-max-attempts must be at least 1"));
        }
        if self.poll_initial_backoff_ms > self.poll_max_backoff_ms {
            return Err(miette::miette!(
                "--poll-initial-backoff-ms ({}) exceeds --poll-max-backoff-ms ({})",
                self.poll_initial_backoff_ms,
                self.poll_max_backoff_ms
            ));
        }
        Ok(PollerConfig {
            initial_backoff: Duration::from_millis(self.poll_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.poll_max_backoff_ms),
            max_attempts: self.poll_max_attempts,
            deadline: Duration::from_secs(self.poll_deadline_secs),
            max_tasks: self.poll_max_tasks,
            call_timeout: Duration::from_secs(self.poll_call_timeout_secs),
        })
    }
}

impl ControllerArgs {
    fn configs(&self) -> miette::Result<(ReconcilerConfig, PodControllerConfig)> {
        if self.resync_secs == 0 {
            return Err(miette::miette!("--resync-secs must be at least 1"));
        }
        Ok((
            ReconcilerConfig {
                call_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            },
            PodControllerConfig {
                resync_interval: Duration::from_secs(self.resync_secs),
                ..PodControllerConfig::default()
            },
        ))
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let token = CancellationToken::new();
    let mut handles: Vec<JoinHandle<miette::Result<()>>> = Vec::new();

    match cli.command {
        Commands::Run {
            cluster,
            webhook,
            poller,
            controller,
        } => {
            let store = cluster.store()?;
            handles.push(spawn_controller(store.clone(), &controller, &token)?);
            handles.push(spawn_webhook(store, &webhook, &poller, &token)?);
        }
        Commands::Webhook {
            cluster,
            webhook,
            poller,
        } => {
            let store = cluster.store()?;
            handles.push(spawn_webhook(store, &webhook, &poller, &token)?);
        }
        Commands::Controller {
            cluster,
            controller,
        } => {
            let store = cluster.store()?;
            handles.push(spawn_controller(store, &controller, &token)?);
        }
    }

    info!("All components started");

    // Wait for shutdown signal, or for a component to exit on its own
    let signal_token = token.clone();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
            info!("Shutting down gracefully...");
        }
        _ = signal_token.cancelled() => {
            warn!("A component stopped, shutting down");
        }
    }
    token.cancel();

    let shutdown_timeout = Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, join_all(handles)).await {
        Ok(Err(e)) => {
            error!("Shutdown after component failure");
            return Err(e);
        }
        Ok(Ok(())) => {}
        Err(_) => warn!("Components did not stop within {:?}", shutdown_timeout),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for every component and return the first failure
async fn join_all(handles: Vec<JoinHandle<miette::Result<()>>>) -> miette::Result<()> {
    let mut first_error = None;
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| miette::miette!("Component task failed: {}", e))
            .and_then(|r| r);
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn spawn_webhook(
    store: Arc<dyn PodStore>,
    args: &WebhookArgs,
    poller_args: &PollerArgs,
    token: &CancellationToken,
) -> miette::Result<JoinHandle<miette::Result<()>>> {
    let config = args.config()?;
    let poller = ConvergencePoller::new(store, poller_args.config()?, token.child_token());
    let state = WebhookState::new(Some(poller), args.policy());
    let server = WebhookServer::new(config, state);

    let server_token = token.clone();
    Ok(tokio::spawn(async move {
        let result = server.run(server_token.clone()).await;
        if let Err(e) = &result {
            error!("Admission webhook error: {:?}", e);
        }
        server_token.cancel();
        result
    }))
}

fn spawn_controller(
    store: Arc<dyn PodStore>,
    args: &ControllerArgs,
    token: &CancellationToken,
) -> miette::Result<JoinHandle<miette::Result<()>>> {
    let (reconciler_config, controller_config) = args.configs()?;
    let reconciler = Reconciler::new(store.clone(), reconciler_config);
    let controller = PodController::new(store, reconciler, controller_config);

    let controller_token = token.clone();
    Ok(tokio::spawn(async move {
        let result = controller.run(controller_token.clone()).await;
        if let Err(e) = &result {
            error!("Pod controller error: {}", e);
        }
        controller_token.cancel();
        result.map_err(miette::Report::new)
    }))
}

/// Install the global subscriber. Unknown levels fall back to `info` with a warning.
fn init_tracing(level: &str, format: LogFormat) {
    let (filter, valid) = match parse_log_filter(level) {
        Some(filter) => (filter, true),
        None => (EnvFilter::new(LevelFilter::INFO.to_string()), false),
    };

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    if !valid {
        warn!(log_level = %level, "Invalid log level, using info");
    }
}

/// Accepts a bare level (with the common `warning`/`fatal`/`panic` aliases)
/// or a full `target=level` directive list.
fn parse_log_filter(level: &str) -> Option<EnvFilter> {
    let level = level.trim().to_ascii_lowercase();
    let level = match level.as_str() {
        "warning" => "warn".to_string(),
        "fatal" | "panic" => "error".to_string(),
        _ => level,
    };

    if level.is_empty() {
        return None;
    }
    if level.contains('=') {
        return EnvFilter::try_new(&level).ok();
    }
    level
        .parse::<LevelFilter>()
        .ok()
        .map(|lf| EnvFilter::new(lf.to_string()))
}
