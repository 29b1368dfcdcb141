use std::sync::Arc;

use async_trait::async_trait;

use crate::coordination::CoordinationClient;
use crate::error::{Result, ShardingError};
use crate::paths::NamespacePaths;
use crate::sharding::{ShardingEvent, ShardingService};
use crate::watch::{TreeListener, TreeWatchService};

/// Per-job watches on `/<ns>/jobs/<job>/config`.
pub struct JobListenerService {
    namespace: String,
    paths: NamespacePaths,
    client: Arc<dyn CoordinationClient>,
    watch: Arc<TreeWatchService>,
    sharding: Arc<ShardingService>,
}

impl JobListenerService {
    pub fn new(
        namespace: impl Into<String>,
        client: Arc<dyn CoordinationClient>,
        watch: Arc<TreeWatchService>,
        sharding: Arc<ShardingService>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            paths: NamespacePaths::new(&namespace),
            namespace,
            client,
            watch,
            sharding,
        }
    }

    /// Attach every job currently present. Returns the number of jobs seen.
    pub async fn attach_to_existing_jobs(&self) -> Result<usize> {
        let jobs = match self.client.children(&self.paths.jobs_root()).await {
            Ok(jobs) => jobs,
            Err(ShardingError::NoNode(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        for job in &jobs {
            self.attach_job(job).await?;
        }
        tracing::debug!(namespace = %self.namespace, jobs = jobs.len(), "Attached existing jobs");
        Ok(jobs.len())
    }

    pub async fn attach_job(&self, job: &str) -> Result<()> {
        let path = self.paths.job_config(job);
        self.watch.add_watch_if_absent(&path, 0).await?;
        let listener = Arc::new(JobConfigListener {
            job: job.to_string(),
            sharding: self.sharding.clone(),
        });
        self.watch.add_listener_if_absent(&path, listener).await?;
        Ok(())
    }

    /// Returns whether the job was attached.
    pub async fn detach_job(&self, job: &str) -> bool {
        self.watch.remove_watch(&self.paths.job_config(job)).await
    }
}

/// Re-shards when a job's configuration appears or changes.
struct JobConfigListener {
    job: String,
    sharding: Arc<ShardingService>,
}

#[async_trait]
impl TreeListener for JobConfigListener {
    async fn on_add(&self, _path: &str, _data: &[u8]) {
        self.sharding
            .trigger_sharding(ShardingEvent::JobConfigChanged(self.job.clone()));
    }

    async fn on_update(&self, _path: &str, _data: &[u8]) {
        self.sharding
            .trigger_sharding(ShardingEvent::JobConfigChanged(self.job.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::coordination::{CreateMode, MemoryCoordinator};

    async fn setup() -> (Arc<crate::coordination::MemoryClient>, JobListenerService) {
        let coordinator = MemoryCoordinator::new();
        let client = coordinator.connect();
        let watch = Arc::new(TreeWatchService::new("ns1", client.clone()));
        watch.start().await;
        let sharding = Arc::new(ShardingService::new(
            client.clone(),
            "ns1",
            &ControllerConfig::new("host-A"),
        ));
        let jobs = JobListenerService::new("ns1", client.clone(), watch, sharding);
        (client, jobs)
    }

    #[tokio::test]
    async fn no_jobs_root_means_no_jobs() {
        let (_client, jobs) = setup().await;
        assert_eq!(jobs.attach_to_existing_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn attaches_one_watch_per_job() {
        let (client, jobs) = setup().await;
        for job in ["a", "b"] {
            client
                .create(&format!("/ns1/jobs/{}/config", job), Vec::new(), CreateMode::Persistent)
                .await
                .unwrap();
        }

        assert_eq!(jobs.attach_to_existing_jobs().await.unwrap(), 2);
        assert_eq!(jobs.attach_to_existing_jobs().await.unwrap(), 2);

        let registrations = jobs.watch.registrations().await;
        let paths: Vec<_> = registrations.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/ns1/jobs/a/config", "/ns1/jobs/b/config"]);
        assert!(registrations.iter().all(|r| r.depth == 0 && r.has_listener));
    }

    #[tokio::test]
    async fn detach_removes_watch() {
        let (_client, jobs) = setup().await;
        jobs.attach_job("a").await.unwrap();
        assert!(jobs.detach_job("a").await);
        assert!(!jobs.detach_job("a").await);
        assert!(jobs.watch.registrations().await.is_empty());
    }
}
