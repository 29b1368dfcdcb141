//! Depth-bounded subtree watches.
//!
//! [`TreeWatchService`] keeps one [`mirror`] per registered path. Each mirror
//! runs on its own task and reports node additions, data changes and removals
//! to the single [`TreeListener`] attached to that path.
//!
//! Registration is idempotent: a second `add_watch_if_absent` for a path that
//! is already mirrored does nothing, and only the first listener attached to a
//! path is kept. Callbacks fire for changes seen after registration; the
//! initial snapshot is loaded silently.

mod mirror;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordination::CoordinationClient;
use crate::error::{Result, ShardingError};

use mirror::{ListenerSlot, Mirror};

/// Callbacks for changes inside a watched subtree. Paths are absolute.
#[async_trait]
pub trait TreeListener: Send + Sync {
    async fn on_add(&self, _path: &str, _data: &[u8]) {}

    async fn on_update(&self, _path: &str, _data: &[u8]) {}

    async fn on_remove(&self, _path: &str) {}
}

/// Snapshot of one active registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRegistration {
    pub path: String,
    pub depth: usize,
    pub has_listener: bool,
}

struct Watch {
    depth: usize,
    listener: Arc<ListenerSlot>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WatchState {
    /// Present while the service is running; parent of every mirror's token.
    token: Option<CancellationToken>,
    watches: HashMap<String, Watch>,
}

pub struct TreeWatchService {
    namespace: String,
    client: Arc<dyn CoordinationClient>,
    state: Mutex<WatchState>,
}

impl TreeWatchService {
    pub fn new(namespace: impl Into<String>, client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            namespace: namespace.into(),
            client,
            state: Mutex::new(WatchState::default()),
        }
    }

    /// Enable registrations. Calling it while running is a no-op.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.token.is_none() {
            state.token = Some(CancellationToken::new());
            tracing::debug!(namespace = %self.namespace, "Tree watch service started");
        }
    }

    /// Release every watch and disable registrations until the next `start`.
    ///
    /// Returns once every callback that was already running has finished, so
    /// no listener acts after this returns.
    pub async fn shutdown(&self) {
        let watches = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.token.take() {
                token.cancel();
            }
            std::mem::take(&mut state.watches)
        };

        // Lock released: a running callback may still try to register
        let released = watches.len();
        for (path, watch) in watches {
            if let Err(e) = watch.task.await {
                tracing::warn!(namespace = %self.namespace, path = %path, error = %e, "Mirror task failed");
            }
        }
        tracing::debug!(namespace = %self.namespace, released, "Tree watch service stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.token.is_some()
    }

    /// Start mirroring `path` down to `depth` levels unless it is already
    /// mirrored.
    pub async fn add_watch_if_absent(&self, path: &str, depth: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        let token = state
            .token
            .as_ref()
            .ok_or(ShardingError::WatchServiceStopped)?
            .child_token();

        if let Some(existing) = state.watches.get(path) {
            tracing::debug!(
                namespace = %self.namespace,
                path,
                depth = existing.depth,
                "Watch already registered"
            );
            return Ok(());
        }

        // Subscribe before the snapshot so nothing in between is missed
        let events = self.client.node_events();
        let snapshot = mirror::load_snapshot(self.client.as_ref(), path, depth).await?;
        let slot = Arc::new(ListenerSlot::default());

        let task = tokio::spawn(mirror::run(
            Mirror::new(path, depth, snapshot),
            events,
            self.client.clone(),
            slot.clone(),
            token.clone(),
        ));

        state.watches.insert(
            path.to_string(),
            Watch {
                depth,
                listener: slot,
                token,
                task,
            },
        );
        tracing::info!(namespace = %self.namespace, path, depth, "Watch registered");
        Ok(())
    }

    /// Attach `listener` to the watch at `path`. Returns `false` if a listener
    /// was already attached (the existing one is kept).
    pub async fn add_listener_if_absent(
        &self,
        path: &str,
        listener: Arc<dyn TreeListener>,
    ) -> Result<bool> {
        let state = self.state.lock().await;
        let watch = state
            .watches
            .get(path)
            .ok_or_else(|| ShardingError::WatchNotRegistered(path.to_string()))?;
        let attached = watch.listener.attach(listener);
        if !attached {
            tracing::debug!(namespace = %self.namespace, path, "Listener already attached");
        }
        Ok(attached)
    }

    /// Release the watch at `path`. Returns whether one was registered.
    pub async fn remove_watch(&self, path: &str) -> bool {
        let removed = self.state.lock().await.watches.remove(path);
        match removed {
            Some(watch) => {
                watch.token.cancel();
                tracing::info!(namespace = %self.namespace, path, "Watch removed");
                true
            }
            None => false,
        }
    }

    /// Active registrations, sorted by path.
    pub async fn registrations(&self) -> Vec<WatchRegistration> {
        let state = self.state.lock().await;
        let mut registrations: Vec<_> = state
            .watches
            .iter()
            .map(|(path, watch)| WatchRegistration {
                path: path.clone(),
                depth: watch.depth,
                has_listener: watch.listener.get().is_some(),
            })
            .collect();
        registrations.sort_by(|a, b| a.path.cmp(&b.path));
        registrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CreateMode, MemoryCoordinator};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TreeListener for Recorder {
        async fn on_add(&self, path: &str, _data: &[u8]) {
            self.events.lock().push(format!("add {}", path));
        }

        async fn on_update(&self, path: &str, data: &[u8]) {
            self.events
                .lock()
                .push(format!("update {} {}", path, String::from_utf8_lossy(data)));
        }

        async fn on_remove(&self, path: &str) {
            self.events.lock().push(format!("remove {}", path));
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn registration_requires_start() {
        let coordinator = MemoryCoordinator::new();
        let service = TreeWatchService::new("ns1", coordinator.connect());
        let err = service.add_watch_if_absent("/ns1/jobs", 1).await.unwrap_err();
        assert!(matches!(err, ShardingError::WatchServiceStopped));
    }

    #[tokio::test]
    async fn listener_requires_watch() {
        let coordinator = MemoryCoordinator::new();
        let service = TreeWatchService::new("ns1", coordinator.connect());
        service.start().await;
        let err = service
            .add_listener_if_absent("/ns1/jobs", Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::WatchNotRegistered(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_one_mirror_and_listener() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;

        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        service.add_watch_if_absent("/ns1/jobs", 1).await.unwrap();
        service.add_watch_if_absent("/ns1/jobs", 2).await.unwrap();
        assert!(service
            .add_listener_if_absent("/ns1/jobs", first.clone())
            .await
            .unwrap());
        assert!(!service
            .add_listener_if_absent("/ns1/jobs", second.clone())
            .await
            .unwrap());

        let registrations = service.registrations().await;
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].depth, 1);
        assert!(registrations[0].has_listener);

        client
            .create("/ns1/jobs/billing", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        settle().await;

        assert_eq!(first.take(), vec!["add /ns1/jobs", "add /ns1/jobs/billing"]);
        assert!(second.take().is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_silent_and_changes_fire_once() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        client
            .create("/ns1/executors/e1/ip", b"a".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;
        let recorder = Arc::new(Recorder::default());
        service.add_watch_if_absent("/ns1/executors", 2).await.unwrap();
        service
            .add_listener_if_absent("/ns1/executors", recorder.clone())
            .await
            .unwrap();

        client
            .set_data("/ns1/executors/e1/ip", b"b".to_vec())
            .await
            .unwrap();
        client
            .create("/ns1/executors/e2/ip", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        // Below depth 2
        client
            .create("/ns1/executors/e2/ip/x", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        client.delete("/ns1/executors/e1/ip").await.unwrap();
        settle().await;

        assert_eq!(
            recorder.take(),
            vec![
                "update /ns1/executors/e1/ip b",
                "add /ns1/executors/e2",
                "add /ns1/executors/e2/ip",
                "remove /ns1/executors/e1/ip",
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_releases_all_watches() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;

        let recorder = Arc::new(Recorder::default());
        service.add_watch_if_absent("/ns1/jobs", 1).await.unwrap();
        service.add_watch_if_absent("/ns1/leader", 1).await.unwrap();
        service
            .add_listener_if_absent("/ns1/jobs", recorder.clone())
            .await
            .unwrap();

        service.shutdown().await;
        assert!(service.registrations().await.is_empty());
        assert!(!service.is_running().await);

        client
            .create("/ns1/jobs/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        settle().await;
        assert!(recorder.take().is_empty());

        // Restart allows registering again
        service.start().await;
        service.add_watch_if_absent("/ns1/jobs", 1).await.unwrap();
        assert_eq!(service.registrations().await.len(), 1);
        assert!(!service.registrations().await[0].has_listener);
    }

    #[tokio::test]
    async fn remove_watch_stops_callbacks() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;

        let recorder = Arc::new(Recorder::default());
        service
            .add_watch_if_absent("/ns1/jobs/a/config", 0)
            .await
            .unwrap();
        service
            .add_listener_if_absent("/ns1/jobs/a/config", recorder.clone())
            .await
            .unwrap();

        assert!(service.remove_watch("/ns1/jobs/a/config").await);
        assert!(!service.remove_watch("/ns1/jobs/a/config").await);

        client
            .create("/ns1/jobs/a/config", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        settle().await;
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn changes_before_listener_attach_are_delivered() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        client
            .create("/ns1/jobs", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;
        service.add_watch_if_absent("/ns1/jobs", 1).await.unwrap();

        // Lands between registering the watch and attaching its listener
        client
            .create("/ns1/jobs/billing", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        settle().await;

        let recorder = Arc::new(Recorder::default());
        service
            .add_listener_if_absent("/ns1/jobs", recorder.clone())
            .await
            .unwrap();
        settle().await;
        assert_eq!(recorder.take(), vec!["add /ns1/jobs/billing"]);

        client.delete("/ns1/jobs/billing").await.unwrap();
        settle().await;
        assert_eq!(recorder.take(), vec!["remove /ns1/jobs/billing"]);
    }

    struct SlowListener {
        finished: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TreeListener for SlowListener {
        async fn on_add(&self, _path: &str, _data: &[u8]) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_callbacks() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;

        let listener = Arc::new(SlowListener {
            finished: std::sync::atomic::AtomicBool::new(false),
        });
        service.add_watch_if_absent("/ns1/leader", 1).await.unwrap();
        service
            .add_listener_if_absent("/ns1/leader", listener.clone())
            .await
            .unwrap();

        client
            .create("/ns1/leader/host", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        // Let the callback start
        tokio::time::sleep(Duration::from_millis(50)).await;

        service.shutdown().await;
        assert!(listener
            .finished
            .load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn registration_fails_while_disconnected() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let service = TreeWatchService::new("ns1", client.clone());
        service.start().await;

        client.suspend();
        let err = service.add_watch_if_absent("/ns1/jobs", 1).await.unwrap_err();
        assert!(matches!(err, ShardingError::ConnectionLoss));
        assert!(service.registrations().await.is_empty());
    }
}
