use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use podlabel_core::{Labels, ObjectSnapshot, PodKey, ResourceVersion};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    /// Server-side error frame; carries no usable object
    Error,
}

/// A change notification for a single pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub event_type: WatchEventType,
    pub key: PodKey,
}

impl PodEvent {
    pub fn new(event_type: WatchEventType, key: PodKey) -> Self {
        Self { event_type, key }
    }
}

/// Stream of pod change events
pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// The narrow cluster contract the convergence paths depend on.
///
/// Implemented over HTTP by `ApiClient` and in memory by `MockPodStore`.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Fetch the current snapshot of a pod, `None` if it does not exist
    async fn get(&self, key: &PodKey) -> Result<Option<ObjectSnapshot>>;

    /// Replace the pod's labels, guarded by `version`.
    ///
    /// Fails with `Conflict` when the stored version differs and `NotFound`
    /// when the pod is gone. Returns the new version on success.
    async fn update_labels(
        &self,
        key: &PodKey,
        version: &ResourceVersion,
        labels: &Labels,
    ) -> Result<ResourceVersion>;

    /// Subscribe to pod change events
    async fn watch(&self) -> Result<PodEventStream>;
}
