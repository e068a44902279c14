use podlabel_controller::ConvergencePoller;
use podlabel_core::PodKey;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Validating-endpoint policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Reject pods whose address or host is not yet assigned
    pub require_placement: bool,
}

/// Shared webhook state
#[derive(Clone)]
pub struct WebhookState {
    /// Catch-up poller for pods admitted before placement; `None` disables it
    pub poller: Option<ConvergencePoller>,

    pub policy: ValidationPolicy,

    /// Certificate and key files checked by the liveness probe
    pub tls_files: Option<(PathBuf, PathBuf)>,

    ready: Arc<AtomicBool>,
}

impl WebhookState {
    pub fn new(poller: Option<ConvergencePoller>, policy: ValidationPolicy) -> Self {
        Self {
            poller,
            policy,
            tls_files: None,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_tls_files(mut self, cert_path: PathBuf, key_path: PathBuf) -> Self {
        self.tls_files = Some((cert_path, key_path));
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Hand a pod to the poller. Returns whether a task was started.
    pub fn schedule_convergence(&self, key: PodKey) -> bool {
        match &self.poller {
            Some(poller) => poller.schedule(key).is_some(),
            None => {
                debug!(pod = %key, "Convergence poller disabled, leaving pod to the reconciler");
                false
            }
        }
    }
}
