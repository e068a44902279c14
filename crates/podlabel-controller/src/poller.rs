//! Bounded catch-up labelling for pods admitted before they were scheduled.
//!
//! The admission response is sent long before the pod gets an address and a
//! node. A [`ConvergencePoller`] task re-fetches the pod on a capped
//! exponential schedule and writes the converged labels once both attributes
//! exist. Each task is limited by an attempt ceiling, a wall-clock deadline
//! and a cancellation token derived from the process token.

use crate::backoff::Backoff;
use crate::error::{ControllerError, Result};
use crate::traits::PodStore;
use parking_lot::Mutex;
use podlabel_core::{compute_desired_labels, converged_labels, ObjectSnapshot, PodKey};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the convergence poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay before the first poll
    pub initial_backoff: Duration,
    /// Upper bound on the delay between polls
    pub max_backoff: Duration,
    /// Polls per task before giving up
    pub max_attempts: u32,
    /// Wall-clock lifetime of a task
    pub deadline: Duration,
    /// Upper bound on concurrently live tasks
    pub max_tasks: usize,
    /// Deadline for a single fetch or write
    pub call_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            max_attempts: 30,
            deadline: Duration::from_secs(300),
            max_tasks: 1024,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a convergence task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Pending,
    Converged,
    Cancelled,
    Failed(String),
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }
}

/// State of one in-flight convergence task
#[derive(Debug)]
pub struct ConvergenceTask {
    pub key: PodKey,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub last_snapshot: Option<ObjectSnapshot>,
    pub outcome: TaskOutcome,
    pub attempts: u32,
}

impl ConvergenceTask {
    fn new(key: PodKey, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            key,
            deadline,
            cancel,
            last_snapshot: None,
            outcome: TaskOutcome::Pending,
            attempts: 0,
        }
    }

    fn finish(mut self, outcome: TaskOutcome) -> TaskOutcome {
        match &outcome {
            TaskOutcome::Converged => info!(
                pod = %self.key,
                attempts = self.attempts,
                "Pod labels converged after scheduling"
            ),
            TaskOutcome::Failed(reason) => warn!(
                pod = %self.key,
                attempts = self.attempts,
                reason = %reason,
                "Giving up on pod label convergence, leaving it to the reconciler"
            ),
            TaskOutcome::Cancelled => debug!(pod = %self.key, "Convergence task cancelled"),
            TaskOutcome::Pending => {}
        }
        self.outcome = outcome;
        self.outcome.clone()
    }
}

/// Result of a single fetch-and-maybe-write cycle
enum PollStep {
    /// Pod not persisted yet
    Absent,
    /// Address or host still unassigned
    Unresolved(ObjectSnapshot),
    /// Labels written, or already correct
    Converged(ObjectSnapshot),
}

/// Removes a key from the active set when the task ends, however it ends
struct ActiveGuard {
    active: Arc<Mutex<HashSet<PodKey>>>,
    key: PodKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

/// Spawns and drives bounded convergence tasks
#[derive(Clone)]
pub struct ConvergencePoller {
    store: Arc<dyn PodStore>,
    config: PollerConfig,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashSet<PodKey>>>,
}

impl ConvergencePoller {
    pub fn new(store: Arc<dyn PodStore>, config: PollerConfig, shutdown: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_tasks));
        Self {
            store,
            config,
            shutdown,
            permits,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Number of tasks currently alive
    pub fn active_tasks(&self) -> usize {
        self.active.lock().len()
    }

    /// Start tracking a pod. Never blocks.
    ///
    /// Returns `None` without spawning when the poller is shutting down, is
    /// at capacity, or already tracks the pod.
    pub fn schedule(&self, key: PodKey) -> Option<JoinHandle<TaskOutcome>> {
        if self.shutdown.is_cancelled() {
            debug!(pod = %key, "Poller is shutting down, not scheduling");
            return None;
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    pod = %key,
                    max_tasks = self.config.max_tasks,
                    "Convergence poller at capacity, deferring pod to the reconciler"
                );
                return None;
            }
        };

        if !self.active.lock().insert(key.clone()) {
            debug!(pod = %key, "Pod already has a live convergence task");
            return None;
        }

        let guard = ActiveGuard {
            active: self.active.clone(),
            key: key.clone(),
        };
        let task = ConvergenceTask::new(
            key,
            Instant::now() + self.config.deadline,
            self.shutdown.child_token(),
        );
        debug!(pod = %task.key, "Scheduled convergence task");

        let poller = self.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            poller.drive(task).await
        }))
    }

    /// Run a task to a terminal outcome
    async fn drive(&self, mut task: ConvergenceTask) -> TaskOutcome {
        let backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let cancel = task.cancel.clone();

        loop {
            let now = Instant::now();
            if now >= task.deadline {
                return task.finish(TaskOutcome::Failed("deadline elapsed".to_string()));
            }
            if task.attempts >= self.config.max_attempts {
                return task.finish(TaskOutcome::Failed(format!(
                    "attempt limit of {} reached",
                    self.config.max_attempts
                )));
            }

            let wait = backoff.delay(task.attempts).min(task.deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return task.finish(TaskOutcome::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            let now = Instant::now();
            if now >= task.deadline {
                return task.finish(TaskOutcome::Failed("deadline elapsed".to_string()));
            }

            task.attempts += 1;
            let limit = self.config.call_timeout.min(task.deadline - now);
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return task.finish(TaskOutcome::Cancelled),
                step = tokio::time::timeout(limit, self.poll_once(&task.key)) => step
                    .unwrap_or_else(|_| Err(ControllerError::timeout("poll pod", limit))),
            };

            match step {
                Ok(PollStep::Converged(snapshot)) => {
                    task.last_snapshot = Some(snapshot);
                    return task.finish(TaskOutcome::Converged);
                }
                Ok(PollStep::Unresolved(snapshot)) => {
                    debug!(
                        pod = %task.key,
                        attempt = task.attempts,
                        missing = ?snapshot.missing_attributes(),
                        "Pod placement still pending"
                    );
                    task.last_snapshot = Some(snapshot);
                }
                Ok(PollStep::Absent) => {
                    debug!(pod = %task.key, attempt = task.attempts, "Pod not persisted yet");
                }
                Err(ControllerError::NotFound { .. }) => {
                    return task.finish(TaskOutcome::Failed(
                        "pod deleted before labels converged".to_string(),
                    ));
                }
                Err(ControllerError::Conflict { .. }) => {
                    debug!(pod = %task.key, "Pod changed during catch-up write, re-fetching");
                }
                Err(e) => {
                    warn!(pod = %task.key, attempt = task.attempts, error = %e, "Convergence poll failed");
                }
            }
        }
    }

    /// Fetch the pod and, once placement is known, write the converged labels.
    ///
    /// Desired labels are recomputed from the fresh snapshot every time, so
    /// changes by other writers to any managed key are corrected as well.
    async fn poll_once(&self, key: &PodKey) -> Result<PollStep> {
        let snapshot = match self.store.get(key).await? {
            Some(snapshot) => snapshot,
            None => return Ok(PollStep::Absent),
        };

        if !snapshot.is_resolved() {
            return Ok(PollStep::Unresolved(snapshot));
        }

        let desired = compute_desired_labels(&snapshot);
        let labels = match converged_labels(snapshot.labels.as_ref(), &desired)? {
            Some(labels) => labels,
            None => return Ok(PollStep::Converged(snapshot)),
        };

        let version = snapshot
            .resource_version
            .as_ref()
            .ok_or_else(|| ControllerError::transient(format!("Pod {} has no resourceVersion", key)))?;

        self.store.update_labels(key, version, &labels).await?;
        Ok(PollStep::Converged(snapshot))
    }
}
