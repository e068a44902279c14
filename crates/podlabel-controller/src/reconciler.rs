use crate::error::{ControllerError, Result};
use crate::traits::PodStore;
use podlabel_core::{compute_desired_labels, converged_labels, PodKey};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Deadline for each cluster call
    pub call_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// What a single reconcile pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Pod no longer exists
    Gone,
    /// Labels already converged
    Unchanged,
    /// Labels written
    Updated,
    /// Pod moved on under us; reconcile again immediately
    Requeue,
}

/// Converges the labels of one pod per call.
///
/// Stateless between calls: every pass reads the current pod, so
/// retries always work from the latest version.
pub struct Reconciler {
    store: Arc<dyn PodStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn PodStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    pub async fn reconcile(&self, key: &PodKey) -> Result<ReconcileAction> {
        let snapshot = match self.bounded("get pod", self.store.get(key)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) | Err(ControllerError::NotFound { .. }) => {
                debug!(pod = %key, "Pod is gone, nothing to reconcile");
                return Ok(ReconcileAction::Gone);
            }
            Err(e) => return Err(e),
        };

        let desired = compute_desired_labels(&snapshot);
        let labels = match converged_labels(snapshot.labels.as_ref(), &desired)? {
            Some(labels) => labels,
            None => return Ok(ReconcileAction::Unchanged),
        };

        let version = snapshot.resource_version.as_ref().ok_or_else(|| {
            ControllerError::transient(format!("Pod {} has no resourceVersion", key))
        })?;

        match self
            .bounded("update labels", self.store.update_labels(key, version, &labels))
            .await
        {
            Ok(new_version) => {
                info!(
                    pod = %key,
                    version = %new_version,
                    pending = desired.is_pending(),
                    "Reconciled pod labels"
                );
                Ok(ReconcileAction::Updated)
            }
            Err(ControllerError::Conflict { .. }) => {
                debug!(pod = %key, version = %version, "Pod changed during reconcile, requeueing");
                Ok(ReconcileAction::Requeue)
            }
            Err(ControllerError::NotFound { .. }) => {
                debug!(pod = %key, "Pod deleted during reconcile");
                Ok(ReconcileAction::Gone)
            }
            Err(e) => Err(e),
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.call_timeout, call)
            .await
            .unwrap_or_else(|_| Err(ControllerError::timeout(operation, self.config.call_timeout)))
    }
}
