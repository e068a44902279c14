use crate::error::{ControllerError, Result};
use crate::traits::{PodEvent, PodEventStream, PodStore, WatchEventType};
use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
use podlabel_core::{Labels, ObjectSnapshot, PodKey, ResourceVersion};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Failure to return from the next `update_labels` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Conflict,
    NotFound,
    Transient,
}

/// In-memory pod store for tests and local development
///
/// Versions increase monotonically across all pods. Every mutation is
/// published on a broadcast channel that backs `watch()`.
pub struct MockPodStore {
    pods: Arc<RwLock<HashMap<PodKey, Pod>>>,
    next_version: AtomicU64,
    event_tx: broadcast::Sender<PodEvent>,
    faults: Mutex<VecDeque<InjectedFault>>,
    get_delay: RwLock<Option<Duration>>,
    updates: AtomicUsize,
    gets: AtomicUsize,
}

impl Default for MockPodStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPodStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            pods: Arc::new(RwLock::new(HashMap::new())),
            next_version: AtomicU64::new(1),
            event_tx,
            faults: Mutex::new(VecDeque::new()),
            get_delay: RwLock::new(None),
            updates: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    fn bump_version(&self) -> ResourceVersion {
        ResourceVersion::new(self.next_version.fetch_add(1, Ordering::SeqCst).to_string())
    }

    fn publish(&self, event_type: WatchEventType, key: &PodKey) {
        // No subscribers is fine
        let _ = self.event_tx.send(PodEvent::new(event_type, key.clone()));
    }

    /// Create or replace a pod, assigning a fresh resource version
    pub async fn insert(&self, mut pod: Pod) -> Result<ResourceVersion> {
        let key = PodKey::from_parts(
            pod.metadata.namespace.as_deref(),
            pod.metadata.name.as_deref(),
        )
        .ok_or_else(|| ControllerError::invalid_config("Pod has no name", "Set metadata.name"))?;

        let version = self.bump_version();
        pod.metadata.namespace = Some(key.namespace.clone());
        pod.metadata.resource_version = Some(version.to_string());

        let existed = self.pods.write().await.insert(key.clone(), pod).is_some();
        let event_type = if existed {
            WatchEventType::Modified
        } else {
            WatchEventType::Added
        };
        debug!("Mock: stored pod {} at version {}", key, version);
        self.publish(event_type, &key);
        Ok(version)
    }

    /// Simulate the scheduler and network plugin assigning placement
    pub async fn assign_placement(
        &self,
        key: &PodKey,
        pod_ip: Option<&str>,
        node_name: Option<&str>,
    ) -> Result<ResourceVersion> {
        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(key)
            .ok_or_else(|| ControllerError::not_found(key.to_string()))?;

        if let Some(node) = node_name {
            pod.spec.get_or_insert_with(PodSpec::default).node_name = Some(node.to_string());
        }
        if let Some(ip) = pod_ip {
            pod.status.get_or_insert_with(PodStatus::default).pod_ip = Some(ip.to_string());
        }

        let version = self.bump_version();
        pod.metadata.resource_version = Some(version.to_string());
        drop(pods);

        self.publish(WatchEventType::Modified, key);
        Ok(version)
    }

    /// Overwrite a single label as an external writer would
    pub async fn set_label(&self, key: &PodKey, name: &str, value: &str) -> Result<ResourceVersion> {
        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(key)
            .ok_or_else(|| ControllerError::not_found(key.to_string()))?;

        pod.metadata
            .labels
            .get_or_insert_with(Labels::new)
            .insert(name.to_string(), value.to_string());

        let version = self.bump_version();
        pod.metadata.resource_version = Some(version.to_string());
        drop(pods);

        self.publish(WatchEventType::Modified, key);
        Ok(version)
    }

    pub async fn delete(&self, key: &PodKey) -> Option<Pod> {
        let removed = self.pods.write().await.remove(key);
        if removed.is_some() {
            self.publish(WatchEventType::Deleted, key);
        }
        removed
    }

    pub async fn pod(&self, key: &PodKey) -> Option<Pod> {
        self.pods.read().await.get(key).cloned()
    }

    pub async fn labels(&self, key: &PodKey) -> Option<Labels> {
        self.pods
            .read()
            .await
            .get(key)
            .and_then(|p| p.metadata.labels.clone())
    }

    /// Queue a failure for the next `update_labels` call
    pub async fn inject_fault(&self, fault: InjectedFault) {
        self.faults.lock().await.push_back(fault);
    }

    /// Delay every `get` by the given duration
    pub async fn set_get_delay(&self, delay: Option<Duration>) {
        *self.get_delay.write().await = delay;
    }

    /// Number of successful label writes
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of `get` calls served
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodStore for MockPodStore {
    async fn get(&self, key: &PodKey) -> Result<Option<ObjectSnapshot>> {
        let delay = *self.get_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.gets.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .pods
            .read()
            .await
            .get(key)
            .map(ObjectSnapshot::from_pod))
    }

    async fn update_labels(
        &self,
        key: &PodKey,
        version: &ResourceVersion,
        labels: &Labels,
    ) -> Result<ResourceVersion> {
        if let Some(fault) = self.faults.lock().await.pop_front() {
            debug!("Mock: injecting {:?} for pod {}", fault, key);
            return Err(match fault {
                InjectedFault::Conflict => ControllerError::conflict(key.to_string(), version.as_str()),
                InjectedFault::NotFound => ControllerError::not_found(key.to_string()),
                InjectedFault::Transient => ControllerError::transient("injected failure"),
            });
        }

        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(key)
            .ok_or_else(|| ControllerError::not_found(key.to_string()))?;

        if pod.metadata.resource_version.as_deref() != Some(version.as_str()) {
            return Err(ControllerError::conflict(key.to_string(), version.as_str()));
        }

        pod.metadata.labels = Some(labels.clone());
        let new_version = self.bump_version();
        pod.metadata.resource_version = Some(new_version.to_string());
        drop(pods);

        self.updates.fetch_add(1, Ordering::SeqCst);
        debug!("Mock: updated labels on pod {} to version {}", key, new_version);
        self.publish(WatchEventType::Modified, key);
        Ok(new_version)
    }

    async fn watch(&self) -> Result<PodEventStream> {
        let stream = BroadcastStream::new(self.event_tx.subscribe()).map(|item| {
            item.map_err(|e| ControllerError::transient(format!("Watch stream lagged: {}", e)))
        });
        Ok(stream.boxed())
    }
}
