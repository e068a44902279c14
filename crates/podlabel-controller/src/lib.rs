// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Podlabel Controller - Cluster access and the two background write paths
//!
//! - `PodStore`: the narrow read/write/watch contract, over HTTP (`ApiClient`)
//!   or in memory (`MockPodStore`)
//! - `ConvergencePoller`: bounded catch-up tasks started at admission time
//! - `Reconciler` and `PodController`: the watch-driven backstop

pub mod api_client;
pub mod backoff;
pub mod controller;
pub mod error;
pub mod mock;
pub mod poller;
pub mod reconciler;
pub mod traits;

// Re-export primary types
pub use api_client::{in_cluster_url, ApiClient, SERVICE_ACCOUNT_DIR};
pub use backoff::Backoff;
pub use controller::{PodController, PodControllerConfig};
pub use error::{ControllerError, Result};
pub use mock::{InjectedFault, MockPodStore};
pub use poller::{ConvergencePoller, ConvergenceTask, PollerConfig, TaskOutcome};
pub use reconciler::{ReconcileAction, Reconciler, ReconcilerConfig};
pub use traits::{PodEvent, PodEventStream, PodStore, WatchEventType};
