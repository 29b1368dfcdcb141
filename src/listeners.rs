//! Listeners for the four namespace subtrees every controller watches.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cleanup::ExecutorCleanupService;
use crate::jobs::JobListenerService;
use crate::paths::NamespacePaths;
use crate::sharding::{ShardingEvent, ShardingService};
use crate::watch::TreeListener;

/// `/<ns>/jobs` at depth 1: jobs coming and going.
pub struct JobsListener {
    paths: NamespacePaths,
    jobs: Arc<JobListenerService>,
    sharding: Arc<ShardingService>,
}

impl JobsListener {
    pub fn new(
        paths: NamespacePaths,
        jobs: Arc<JobListenerService>,
        sharding: Arc<ShardingService>,
    ) -> Self {
        Self {
            paths,
            jobs,
            sharding,
        }
    }
}

#[async_trait]
impl TreeListener for JobsListener {
    async fn on_add(&self, path: &str, _data: &[u8]) {
        let Some(job) = self.paths.job_name(path) else {
            return;
        };
        tracing::info!(namespace = %self.paths.root(), job, "Job added");
        if let Err(e) = self.jobs.attach_job(job).await {
            tracing::warn!(namespace = %self.paths.root(), job, error = %e, "Failed to attach job");
        }
        self.sharding
            .trigger_sharding(ShardingEvent::JobAdded(job.to_string()));
    }

    async fn on_remove(&self, path: &str) {
        let Some(job) = self.paths.job_name(path) else {
            return;
        };
        tracing::info!(namespace = %self.paths.root(), job, "Job removed");
        self.jobs.detach_job(job).await;
        self.sharding
            .trigger_sharding(ShardingEvent::JobRemoved(job.to_string()));
    }
}

/// `/<ns>/executors` at depth 2: the ephemeral `ip` node marks an executor
/// online.
pub struct ExecutorPresenceListener {
    paths: NamespacePaths,
    sharding: Arc<ShardingService>,
    cleanup: Arc<ExecutorCleanupService>,
}

impl ExecutorPresenceListener {
    pub fn new(
        paths: NamespacePaths,
        sharding: Arc<ShardingService>,
        cleanup: Arc<ExecutorCleanupService>,
    ) -> Self {
        Self {
            paths,
            sharding,
            cleanup,
        }
    }
}

#[async_trait]
impl TreeListener for ExecutorPresenceListener {
    async fn on_add(&self, path: &str, _data: &[u8]) {
        if let Some(executor) = self.paths.executor_from_ip(path) {
            tracing::info!(namespace = %self.paths.root(), executor, "Executor online");
            self.sharding
                .trigger_sharding(ShardingEvent::ExecutorOnline(executor.to_string()));
        }
    }

    async fn on_remove(&self, path: &str) {
        if let Some(executor) = self.paths.executor_from_ip(path) {
            tracing::info!(namespace = %self.paths.root(), executor, "Executor offline");
            self.sharding
                .trigger_sharding(ShardingEvent::ExecutorOffline(executor.to_string()));
            self.cleanup.clean(executor).await;
        }
    }
}

/// `/<ns>/sharding` at depth 1: any write to a child asks for a re-shard.
pub struct ShardingTriggerListener {
    paths: NamespacePaths,
    sharding: Arc<ShardingService>,
}

impl ShardingTriggerListener {
    pub fn new(paths: NamespacePaths, sharding: Arc<ShardingService>) -> Self {
        Self { paths, sharding }
    }

    fn request(&self, path: &str) {
        if let Some(trigger) = self.paths.sharding_trigger(path) {
            tracing::debug!(namespace = %self.paths.root(), trigger, "Re-sharding requested");
            self.sharding.trigger_sharding(ShardingEvent::Requested {
                trigger: trigger.to_string(),
            });
        }
    }
}

#[async_trait]
impl TreeListener for ShardingTriggerListener {
    async fn on_add(&self, path: &str, _data: &[u8]) {
        self.request(path);
    }

    async fn on_update(&self, path: &str, _data: &[u8]) {
        self.request(path);
    }
}

/// `/<ns>/leader` at depth 1: contend again whenever the marker disappears.
pub struct LeaderElectionListener {
    paths: NamespacePaths,
    sharding: Arc<ShardingService>,
}

impl LeaderElectionListener {
    pub fn new(paths: NamespacePaths, sharding: Arc<ShardingService>) -> Self {
        Self { paths, sharding }
    }
}

#[async_trait]
impl TreeListener for LeaderElectionListener {
    async fn on_add(&self, path: &str, data: &[u8]) {
        if self.paths.is_leader_host(path) {
            tracing::info!(
                namespace = %self.paths.root(),
                leader = %String::from_utf8_lossy(data),
                "Leader elected"
            );
        }
    }

    async fn on_remove(&self, path: &str) {
        if self.paths.is_leader_host(path) {
            tracing::info!(namespace = %self.paths.root(), "Leadership released, contending");
            self.sharding.elect_leader().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::coordination::{CoordinationClient, CreateMode, MemoryClient, MemoryCoordinator};
    use crate::watch::TreeWatchService;

    struct Fixture {
        client: Arc<MemoryClient>,
        watch: Arc<TreeWatchService>,
        sharding: Arc<ShardingService>,
        jobs: Arc<JobListenerService>,
    }

    async fn fixture(coordinator: &MemoryCoordinator, host: &str) -> Fixture {
        let client = coordinator.connect();
        let watch = Arc::new(TreeWatchService::new("ns1", client.clone()));
        watch.start().await;
        let sharding = Arc::new(ShardingService::new(
            client.clone(),
            "ns1",
            &ControllerConfig::new(host),
        ));
        let jobs = Arc::new(JobListenerService::new(
            "ns1",
            client.clone(),
            watch.clone(),
            sharding.clone(),
        ));
        Fixture {
            client,
            watch,
            sharding,
            jobs,
        }
    }

    #[tokio::test]
    async fn job_add_and_remove_manage_config_watch() {
        let coordinator = MemoryCoordinator::new();
        let f = fixture(&coordinator, "host-A").await;
        let listener = JobsListener::new(NamespacePaths::new("ns1"), f.jobs.clone(), f.sharding.clone());

        listener.on_add("/ns1/jobs/billing", b"").await;
        // Nested nodes are not jobs
        listener.on_add("/ns1/jobs/billing/config", b"").await;
        let registrations = f.watch.registrations().await;
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].path, "/ns1/jobs/billing/config");

        listener.on_remove("/ns1/jobs/billing").await;
        assert!(f.watch.registrations().await.is_empty());
    }

    #[tokio::test]
    async fn executor_removal_triggers_cleanup() {
        let coordinator = MemoryCoordinator::new();
        let f = fixture(&coordinator, "host-A").await;
        f.client
            .create("/ns1/jobs/a/servers/e1", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        f.client
            .create("/ns1/executors/e1/version", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let cleanup = Arc::new(ExecutorCleanupService::new("ns1", f.client.clone()));
        let listener =
            ExecutorPresenceListener::new(NamespacePaths::new("ns1"), f.sharding.clone(), cleanup);

        // Only the ip node counts
        listener.on_remove("/ns1/executors/e1/version").await;
        assert!(f.client.exists("/ns1/jobs/a/servers/e1").await.unwrap());

        listener.on_remove("/ns1/executors/e1/ip").await;
        assert!(!f.client.exists("/ns1/jobs/a/servers/e1").await.unwrap());
        assert!(!f.client.exists("/ns1/executors/e1").await.unwrap());
    }

    #[tokio::test]
    async fn leader_removal_re_elects() {
        let coordinator = MemoryCoordinator::new();
        let a = fixture(&coordinator, "host-A").await;
        let b = fixture(&coordinator, "host-B").await;
        a.sharding.elect_leader().await;
        b.sharding.elect_leader().await;
        assert!(!b.sharding.is_leader());

        a.sharding.shutdown().await;
        let listener = LeaderElectionListener::new(NamespacePaths::new("ns1"), b.sharding.clone());
        listener.on_remove("/ns1/leader/host").await;

        assert!(b.sharding.is_leader());
        assert_eq!(
            a.client.get_data("/ns1/leader/host").await.unwrap(),
            Some(b"host-B".to_vec())
        );
        b.sharding.shutdown().await;
    }

    #[tokio::test]
    async fn unrelated_leader_children_are_ignored() {
        let coordinator = MemoryCoordinator::new();
        let a = fixture(&coordinator, "host-A").await;
        let listener = LeaderElectionListener::new(NamespacePaths::new("ns1"), a.sharding.clone());
        listener.on_remove("/ns1/leader/other").await;
        assert!(!a.sharding.is_leader());
    }
}
