use crate::backoff::Backoff;
use crate::error::Result;
use crate::reconciler::{ReconcileAction, Reconciler};
use crate::traits::{PodEvent, PodEventStream, PodStore, WatchEventType};
use futures_util::StreamExt;
use podlabel_core::PodKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

/// Configuration for the pod controller
#[derive(Debug, Clone)]
pub struct PodControllerConfig {
    /// Interval at which every known pod is reconciled again
    pub resync_interval: Duration,
    /// First delay after a failed reconcile
    pub error_backoff_initial: Duration,
    /// Upper bound on the failed-reconcile delay
    pub error_backoff_max: Duration,
    /// Delay before re-subscribing after the watch stream ends or fails
    pub watch_retry_delay: Duration,
}

impl Default for PodControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            error_backoff_initial: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(60),
            watch_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Keys waiting to be reconciled, either now or after a backoff
#[derive(Default)]
struct WorkQueue {
    ready: VecDeque<PodKey>,
    queued: HashSet<PodKey>,
    delayed: DelayQueue<PodKey>,
    delayed_keys: HashMap<PodKey, delay_queue::Key>,
    failures: HashMap<PodKey, u32>,
}

impl WorkQueue {
    /// Queue a key for immediate processing; a pending backoff for it is dropped
    fn enqueue(&mut self, key: PodKey) {
        if let Some(handle) = self.delayed_keys.remove(&key) {
            self.delayed.remove(&handle);
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    fn enqueue_after(&mut self, key: PodKey, delay: Duration) {
        if self.queued.contains(&key) {
            return;
        }
        match self.delayed_keys.get(&key) {
            Some(handle) => self.delayed.reset(handle, delay),
            None => {
                let handle = self.delayed.insert(key.clone(), delay);
                self.delayed_keys.insert(key, handle);
            }
        }
    }

    fn pop(&mut self) -> Option<PodKey> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn has_delayed(&self) -> bool {
        !self.delayed.is_empty()
    }

    /// Wait for the next backoff to expire. Only call when `has_delayed()`.
    async fn next_expired(&mut self) -> Option<PodKey> {
        let expired = std::future::poll_fn(|cx| self.delayed.poll_expired(cx)).await?;
        let key = expired.into_inner();
        self.delayed_keys.remove(&key);
        Some(key)
    }

    /// Count a failure and return how many consecutive failures the key has
    fn record_failure(&mut self, key: &PodKey) -> u32 {
        let count = self.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_failures(&mut self, key: &PodKey) {
        self.failures.remove(key);
    }

    fn forget(&mut self, key: &PodKey) {
        if let Some(handle) = self.delayed_keys.remove(key) {
            self.delayed.remove(&handle);
        }
        if self.queued.remove(key) {
            self.ready.retain(|k| k != key);
        }
        self.failures.remove(key);
    }
}

/// Watches pods and drives every one of them to its desired labels.
///
/// Keys are processed one at a time, so a pod is never reconciled
/// concurrently with itself.
pub struct PodController {
    store: Arc<dyn PodStore>,
    reconciler: Reconciler,
    config: PodControllerConfig,
}

impl PodController {
    pub fn new(store: Arc<dyn PodStore>, reconciler: Reconciler, config: PodControllerConfig) -> Self {
        Self {
            store,
            reconciler,
            config,
        }
    }

    /// Run the controller until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting pod controller (resync: {:?}, error backoff: {:?}..{:?})",
            self.config.resync_interval,
            self.config.error_backoff_initial,
            self.config.error_backoff_max
        );

        let backoff = Backoff::new(self.config.error_backoff_initial, self.config.error_backoff_max);
        let mut queue = WorkQueue::default();
        let mut known: HashSet<PodKey> = HashSet::new();
        let mut watch: Option<PodEventStream> = None;
        let mut next_watch_attempt = Instant::now();

        let mut resync = tokio::time::interval(self.config.resync_interval);
        // First tick fires immediately and there is nothing known yet
        resync.tick().await;

        loop {
            if watch.is_none() && Instant::now() >= next_watch_attempt {
                match self.store.watch().await {
                    Ok(stream) => {
                        info!("Subscribed to pod events");
                        watch = Some(stream);
                        // Catch up on anything missed while unsubscribed
                        for key in &known {
                            queue.enqueue(key.clone());
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Failed to subscribe to pod events, retrying in {:?}: {}",
                            self.config.watch_retry_delay, e
                        );
                        next_watch_attempt = Instant::now() + self.config.watch_retry_delay;
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod controller shutting down");
                    return Ok(());
                }
                event = next_event(&mut watch) => match event {
                    Some(Ok(event)) => handle_event(event, &mut known, &mut queue),
                    Some(Err(e)) => {
                        warn!("Pod watch failed, re-subscribing: {}", e);
                        watch = None;
                        next_watch_attempt = Instant::now() + self.config.watch_retry_delay;
                    }
                    None => {
                        debug!("Pod watch stream ended, re-subscribing");
                        watch = None;
                        next_watch_attempt = Instant::now() + self.config.watch_retry_delay;
                    }
                },
                _ = tokio::time::sleep_until(next_watch_attempt), if watch.is_none() => {}
                Some(key) = queue.next_expired(), if queue.has_delayed() => {
                    debug!(pod = %key, "Backoff expired, requeueing");
                    queue.enqueue(key);
                }
                _ = resync.tick() => {
                    debug!(pods = known.len(), "Resyncing known pods");
                    for key in &known {
                        queue.enqueue(key.clone());
                    }
                }
                _ = std::future::ready(()), if queue.has_ready() => {
                    if let Some(key) = queue.pop() {
                        tokio::select! {
                            _ = token.cancelled() => {
                                info!("Pod controller shutting down");
                                return Ok(());
                            }
                            result = self.reconciler.reconcile(&key) => {
                                self.finish(key, result, &backoff, &mut known, &mut queue);
                            }
                        }
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        key: PodKey,
        result: Result<ReconcileAction>,
        backoff: &Backoff,
        known: &mut HashSet<PodKey>,
        queue: &mut WorkQueue,
    ) {
        match result {
            Ok(ReconcileAction::Gone) => {
                known.remove(&key);
                queue.forget(&key);
            }
            Ok(ReconcileAction::Unchanged) | Ok(ReconcileAction::Updated) => {
                queue.clear_failures(&key);
            }
            Ok(ReconcileAction::Requeue) => queue.enqueue(key),
            Err(e) => {
                let failures = queue.record_failure(&key);
                let delay = backoff.delay(failures - 1);
                error!(
                    pod = %key,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to reconcile pod: {}",
                    e
                );
                queue.enqueue_after(key, delay);
            }
        }
    }
}

async fn next_event(watch: &mut Option<PodEventStream>) -> Option<Result<PodEvent>> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn handle_event(event: PodEvent, known: &mut HashSet<PodKey>, queue: &mut WorkQueue) {
    match event.event_type {
        WatchEventType::Added | WatchEventType::Modified => {
            known.insert(event.key.clone());
            queue.enqueue(event.key);
        }
        WatchEventType::Deleted => {
            debug!(pod = %event.key, "Pod deleted, forgetting");
            known.remove(&event.key);
            queue.forget(&event.key);
        }
        WatchEventType::Error => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControllerError;
    use crate::mock::{InjectedFault, MockPodStore};
    use crate::reconciler::ReconcilerConfig;
    use async_trait::async_trait;
    use futures_util::stream;
    use k8s_openapi::api::core::v1::Pod;
    use podlabel_core::labels::{
        ENVIRONMENT_LABEL, ENVIRONMENT_VALUE, IP_ADDRESS_LABEL, MISSING_VALUES_LABEL,
        NODE_NAME_LABEL,
    };
    use podlabel_core::{Labels, ObjectSnapshot, ResourceVersion};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;

    /// What a single `watch()` call returns
    enum WatchScript {
        Fail,
        /// Deliver the events, then stay open without sending anything
        Silent(Vec<PodEvent>),
        /// Deliver the events, then end the stream
        End(Vec<PodEvent>),
    }

    /// Reads and writes go to the mock; `watch()` follows a script and stays
    /// silent once the script is used up
    struct ScriptedWatchStore {
        inner: Arc<MockPodStore>,
        scripts: parking_lot::Mutex<VecDeque<WatchScript>>,
        watches: AtomicUsize,
    }

    impl ScriptedWatchStore {
        fn new(inner: Arc<MockPodStore>, scripts: Vec<WatchScript>) -> Self {
            Self {
                inner,
                scripts: parking_lot::Mutex::new(scripts.into()),
                watches: AtomicUsize::new(0),
            }
        }

        fn watch_count(&self) -> usize {
            self.watches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PodStore for ScriptedWatchStore {
        async fn get(&self, key: &PodKey) -> Result<Option<ObjectSnapshot>> {
            self.inner.get(key).await
        }

        async fn update_labels(
            &self,
            key: &PodKey,
            version: &ResourceVersion,
            labels: &Labels,
        ) -> Result<ResourceVersion> {
            self.inner.update_labels(key, version, labels).await
        }

        async fn watch(&self) -> Result<PodEventStream> {
            self.watches.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front();
            match script {
                Some(WatchScript::Fail) => Err(ControllerError::transient("watch refused")),
                Some(WatchScript::Silent(events)) => Ok(stream::iter(events.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed()),
                Some(WatchScript::End(events)) => {
                    Ok(stream::iter(events.into_iter().map(Ok)).boxed())
                }
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn make_pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod
    }

    fn test_config() -> PodControllerConfig {
        PodControllerConfig {
            resync_interval: Duration::from_secs(60),
            error_backoff_initial: Duration::from_millis(100),
            error_backoff_max: Duration::from_secs(1),
            watch_retry_delay: Duration::from_millis(100),
        }
    }

    async fn start(
        store: Arc<dyn PodStore>,
    ) -> (CancellationToken, JoinHandle<Result<()>>) {
        let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
        let controller = PodController::new(store, reconciler, test_config());
        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { controller.run(run_token).await });
        // Let the controller subscribe before producing events
        tokio::time::sleep(Duration::from_millis(10)).await;
        (token, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_labels_follow_placement() {
        let store = Arc::new(MockPodStore::new());
        let (token, handle) = start(store.clone()).await;
        let key = PodKey::new("default", "web");

        store.insert(make_pod("web")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let labels = store.labels(&key).await.unwrap();
        assert_eq!(labels[IP_ADDRESS_LABEL], "pending");
        assert_eq!(labels[MISSING_VALUES_LABEL], "true");

        store
            .assign_placement(&key, Some("10.0.0.5"), Some("node-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let labels = store.labels(&key).await.unwrap();
        assert_eq!(labels[IP_ADDRESS_LABEL], "10.0.0.5");
        assert_eq!(labels[NODE_NAME_LABEL], "node-1");
        assert!(!labels.contains_key(MISSING_VALUES_LABEL));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_retried_immediately() {
        let store = Arc::new(MockPodStore::new());
        let (token, handle) = start(store.clone()).await;
        store.inject_fault(InjectedFault::Conflict).await;

        store.insert(make_pod("web")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.update_count(), 1);
        assert!(store.labels(&PodKey::new("default", "web")).await.is_some());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_after_backoff() {
        let store = Arc::new(MockPodStore::new());
        let (token, handle) = start(store.clone()).await;
        store.inject_fault(InjectedFault::Transient).await;

        store.insert(make_pod("web")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.update_count(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.update_count(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_repairs_drift_missed_by_watch() {
        let mock = Arc::new(MockPodStore::new());
        let key = PodKey::new("default", "web");
        mock.insert(make_pod("web")).await.unwrap();
        let store = Arc::new(ScriptedWatchStore::new(
            mock.clone(),
            vec![WatchScript::Silent(vec![PodEvent::new(
                WatchEventType::Added,
                key.clone(),
            )])],
        ));
        let (token, handle) = start(store.clone()).await;

        let labels = mock.labels(&key).await.unwrap();
        assert_eq!(labels[ENVIRONMENT_LABEL], ENVIRONMENT_VALUE);

        // The watch never reports this write
        mock.set_label(&key, ENVIRONMENT_LABEL, "staging").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.labels(&key).await.unwrap()[ENVIRONMENT_LABEL], "staging");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(
            mock.labels(&key).await.unwrap()[ENVIRONMENT_LABEL],
            ENVIRONMENT_VALUE
        );
        assert_eq!(store.watch_count(), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_requeues_known_pods() {
        let mock = Arc::new(MockPodStore::new());
        let key = PodKey::new("default", "web");
        mock.insert(make_pod("web")).await.unwrap();
        let store = Arc::new(ScriptedWatchStore::new(
            mock.clone(),
            vec![
                WatchScript::Fail,
                WatchScript::End(vec![PodEvent::new(WatchEventType::Added, key.clone())]),
            ],
        ));
        let (token, handle) = start(store.clone()).await;

        // Subscription refused, retried after watch_retry_delay
        assert_eq!(store.watch_count(), 1);
        assert!(mock.labels(&key).await.is_none());

        tokio::time::sleep(Duration::from_millis(140)).await;
        assert_eq!(store.watch_count(), 2);
        assert_eq!(
            mock.labels(&key).await.unwrap()[ENVIRONMENT_LABEL],
            ENVIRONMENT_VALUE
        );

        // The second stream has ended; drift is repaired on re-subscribe,
        // well before the next resync
        mock.set_label(&key, ENVIRONMENT_LABEL, "staging").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.watch_count(), 3);
        assert_eq!(
            mock.labels(&key).await.unwrap()[ENVIRONMENT_LABEL],
            ENVIRONMENT_VALUE
        );

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_ok() {
        let store = Arc::new(MockPodStore::new());
        let (token, handle) = start(store).await;
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_work_queue_dedups_ready_keys() {
        let mut queue = WorkQueue::default();
        let key = PodKey::new("default", "web");
        queue.enqueue(key.clone());
        queue.enqueue(key.clone());

        assert_eq!(queue.pop(), Some(key));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_queue_delayed_key_expires() {
        let mut queue = WorkQueue::default();
        let key = PodKey::new("default", "web");
        queue.enqueue_after(key.clone(), Duration::from_secs(2));
        assert!(queue.has_delayed());
        assert!(!queue.has_ready());

        assert_eq!(queue.next_expired().await, Some(key));
        assert!(!queue.has_delayed());
    }

    #[tokio::test]
    async fn test_work_queue_enqueue_cancels_backoff() {
        let mut queue = WorkQueue::default();
        let key = PodKey::new("default", "web");
        queue.enqueue_after(key.clone(), Duration::from_secs(60));
        queue.enqueue(key.clone());

        assert!(!queue.has_delayed());
        assert_eq!(queue.pop(), Some(key));
    }

    #[tokio::test]
    async fn test_work_queue_forget() {
        let mut queue = WorkQueue::default();
        let a = PodKey::new("default", "a");
        let b = PodKey::new("default", "b");
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        queue.enqueue_after(PodKey::new("default", "c"), Duration::from_secs(5));
        assert_eq!(queue.record_failure(&a), 1);
        assert_eq!(queue.record_failure(&a), 2);

        queue.forget(&a);
        queue.forget(&PodKey::new("default", "c"));

        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), None);
        assert!(!queue.has_delayed());
        assert_eq!(queue.record_failure(&a), 1);
    }

    #[test]
    fn test_deleted_event_forgets_key() {
        let mut queue = WorkQueue::default();
        let mut known = HashSet::new();
        let key = PodKey::new("default", "web");

        handle_event(
            PodEvent::new(WatchEventType::Added, key.clone()),
            &mut known,
            &mut queue,
        );
        assert!(known.contains(&key));
        assert!(queue.has_ready());

        handle_event(
            PodEvent::new(WatchEventType::Deleted, key.clone()),
            &mut known,
            &mut queue,
        );
        assert!(known.is_empty());
        assert!(!queue.has_ready());
    }
}
