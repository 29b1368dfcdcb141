use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cleanup::ExecutorCleanupService;
use crate::config::ControllerConfig;
use crate::coordination::{self, CoordinationClient, ListenerId};
use crate::error::Result;
use crate::jobs::JobListenerService;
use crate::listeners::{
    ExecutorPresenceListener, JobsListener, LeaderElectionListener, ShardingTriggerListener,
};
use crate::paths::NamespacePaths;
use crate::recovery::{ConnectionLostListener, Recoverable};
use crate::sharding::ShardingService;
use crate::watch::{TreeListener, TreeWatchService};

const JOBS_DEPTH: usize = 1;
const EXECUTORS_DEPTH: usize = 2;
const SHARDING_DEPTH: usize = 1;
const LEADER_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Stopped,
    Running,
}

struct InstalledHandler {
    id: ListenerId,
    listener: Arc<ConnectionLostListener>,
}

struct Lifecycle {
    state: LifecycleState,
    handler: Option<InstalledHandler>,
}

/// A subtree every controller keeps watched while running.
struct FixedWatch {
    path: String,
    depth: usize,
    listener: Arc<dyn TreeListener>,
}

/// Everything `start`/`stop` and connection recovery act on.
struct ControllerCore {
    namespace: String,
    client: Arc<dyn CoordinationClient>,
    watch: Arc<TreeWatchService>,
    sharding: Arc<ShardingService>,
    jobs: Arc<JobListenerService>,
    fixed: Vec<FixedWatch>,
}

impl ControllerCore {
    async fn do_start(&self) -> Result<()> {
        self.watch.start().await;
        self.sharding.elect_leader().await;
        self.jobs.attach_to_existing_jobs().await?;

        for fixed in &self.fixed {
            self.ensure_path(&fixed.path).await;
            self.watch
                .add_watch_if_absent(&fixed.path, fixed.depth)
                .await?;
            self.watch
                .add_listener_if_absent(&fixed.path, fixed.listener.clone())
                .await?;
        }
        Ok(())
    }

    async fn do_stop(&self) {
        self.watch.shutdown().await;
        self.sharding.shutdown().await;
    }

    /// Pre-create a watched root. Failures are only logged; the mirror picks
    /// the node up once it exists.
    async fn ensure_path(&self, path: &str) {
        if let Err(e) = coordination::create_if_absent(self.client.as_ref(), path).await {
            tracing::warn!(namespace = %self.namespace, path, error = %e, "Failed to create watched path");
        }
    }
}

#[async_trait]
impl Recoverable for ControllerCore {
    async fn stop(&self) {
        self.do_stop().await;
    }

    async fn restart(&self) -> Result<()> {
        self.do_start().await
    }
}

/// Coordination controller for one namespace.
///
/// While running it keeps four subtrees of the namespace watched, contends
/// for leadership and, on session loss, tears everything down and rebuilds it
/// once the session is restored. Construction starts nothing.
pub struct ShardingController {
    core: Arc<ControllerCore>,
    config: ControllerConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl ShardingController {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        namespace: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self::with_config(client, namespace, ControllerConfig::new(host))
    }

    pub fn with_config(
        client: Arc<dyn CoordinationClient>,
        namespace: impl Into<String>,
        config: ControllerConfig,
    ) -> Self {
        let namespace = namespace.into();
        let paths = NamespacePaths::new(&namespace);

        let watch = Arc::new(TreeWatchService::new(namespace.clone(), client.clone()));
        let sharding = Arc::new(ShardingService::new(client.clone(), namespace.clone(), &config));
        let jobs = Arc::new(JobListenerService::new(
            namespace.clone(),
            client.clone(),
            watch.clone(),
            sharding.clone(),
        ));
        let cleanup = Arc::new(ExecutorCleanupService::new(namespace.clone(), client.clone()));

        let fixed = vec![
            FixedWatch {
                path: paths.jobs_root(),
                depth: JOBS_DEPTH,
                listener: Arc::new(JobsListener::new(
                    paths.clone(),
                    jobs.clone(),
                    sharding.clone(),
                )),
            },
            FixedWatch {
                path: paths.executors_root(),
                depth: EXECUTORS_DEPTH,
                listener: Arc::new(ExecutorPresenceListener::new(
                    paths.clone(),
                    sharding.clone(),
                    cleanup,
                )),
            },
            FixedWatch {
                path: paths.sharding_root(),
                depth: SHARDING_DEPTH,
                listener: Arc::new(ShardingTriggerListener::new(paths.clone(), sharding.clone())),
            },
            FixedWatch {
                path: paths.leader_root(),
                depth: LEADER_DEPTH,
                listener: Arc::new(LeaderElectionListener::new(paths, sharding.clone())),
            },
        ];

        Self {
            core: Arc::new(ControllerCore {
                namespace,
                client,
                watch,
                sharding,
                jobs,
                fixed,
            }),
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Stopped,
                handler: None,
            }),
        }
    }

    /// Start watching the namespace and contend for leadership. A second call
    /// while running does nothing.
    ///
    /// The connection-loss handler is installed even if startup fails, so a
    /// later session restore retries it. The controller stays running either
    /// way; call [`stop`](Self::stop) to tear it down.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == LifecycleState::Running {
            tracing::debug!(namespace = %self.core.namespace, "Controller already running");
            return Ok(());
        }
        lifecycle.state = LifecycleState::Running;
        tracing::info!(namespace = %self.core.namespace, host = %self.config.host, "Starting controller");

        let result = self.core.do_start().await;

        let listener = ConnectionLostListener::spawn(
            self.core.namespace.clone(),
            self.core.clone(),
            self.config.recovery_queue_capacity,
        );
        let id = self.core.client.add_connection_listener(listener.clone());
        lifecycle.handler = Some(InstalledHandler { id, listener });

        if let Err(e) = &result {
            tracing::error!(namespace = %self.core.namespace, error = %e, "Controller startup failed");
        }
        result
    }

    /// Release every watch and leadership. A call while stopped does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == LifecycleState::Stopped {
            tracing::debug!(namespace = %self.core.namespace, "Controller already stopped");
            return;
        }
        lifecycle.state = LifecycleState::Stopped;

        self.core.do_stop().await;

        if let Some(handler) = lifecycle.handler.take() {
            self.core.client.remove_connection_listener(handler.id);
            handler.listener.shutdown();
        }
        tracing::info!(namespace = %self.core.namespace, "Controller stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.state == LifecycleState::Running
    }

    pub fn namespace(&self) -> &str {
        &self.core.namespace
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.core.client
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn sharding_service(&self) -> &Arc<ShardingService> {
        &self.core.sharding
    }

    pub fn watch_service(&self) -> &Arc<TreeWatchService> {
        &self.core.watch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;

    fn controller(coordinator: &MemoryCoordinator, host: &str) -> ShardingController {
        ShardingController::new(coordinator.connect(), "ns1", host)
    }

    #[tokio::test]
    async fn construction_starts_nothing() {
        let coordinator = MemoryCoordinator::new();
        let controller = controller(&coordinator, "host-A");
        assert!(!controller.is_running().await);
        assert!(!controller.watch_service().is_running().await);
        assert_eq!(coordinator.node_count(), 1);
    }

    #[tokio::test]
    async fn start_registers_fixed_watches() {
        let coordinator = MemoryCoordinator::new();
        let controller = controller(&coordinator, "host-A");
        controller.start().await.unwrap();

        let registrations = controller.watch_service().registrations().await;
        let watched: Vec<_> = registrations
            .iter()
            .map(|r| (r.path.as_str(), r.depth, r.has_listener))
            .collect();
        assert_eq!(
            watched,
            vec![
                ("/ns1/executors", 2, true),
                ("/ns1/jobs", 1, true),
                ("/ns1/leader", 1, true),
                ("/ns1/sharding", 1, true),
            ]
        );
        assert!(controller.sharding_service().is_leader());

        controller.stop().await;
    }

    #[tokio::test]
    async fn handler_installed_once_and_removed_on_stop() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let controller = ShardingController::new(client.clone(), "ns1", "host-A");

        controller.start().await.unwrap();
        controller.start().await.unwrap();
        assert_eq!(client.connection_listener_count(), 1);

        controller.stop().await;
        controller.stop().await;
        assert_eq!(client.connection_listener_count(), 0);
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn zero_capacities_from_struct_literal_are_usable() {
        let coordinator = MemoryCoordinator::new();
        let config = ControllerConfig {
            sharding_queue_capacity: 0,
            recovery_queue_capacity: 0,
            ..ControllerConfig::new("host-A")
        };
        let controller = ShardingController::with_config(coordinator.connect(), "ns1", config);

        controller.start().await.unwrap();
        assert!(controller.sharding_service().is_leader());
        controller.stop().await;
    }

    #[tokio::test]
    async fn failed_start_stays_running() {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let controller = ShardingController::new(client.clone(), "ns1", "host-A");

        client.suspend();
        assert!(controller.start().await.is_err());
        assert!(controller.is_running().await);
        assert_eq!(client.connection_listener_count(), 1);

        controller.stop().await;
        assert!(!controller.is_running().await);
    }
}
