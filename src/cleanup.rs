use std::sync::Arc;

use crate::coordination::{self, CoordinationClient};
use crate::error::{Result, ShardingError};
use crate::paths::NamespacePaths;

/// Removes the persistent state an offline executor leaves behind.
pub struct ExecutorCleanupService {
    namespace: String,
    paths: NamespacePaths,
    client: Arc<dyn CoordinationClient>,
}

impl ExecutorCleanupService {
    pub fn new(namespace: impl Into<String>, client: Arc<dyn CoordinationClient>) -> Self {
        let namespace = namespace.into();
        Self {
            paths: NamespacePaths::new(&namespace),
            namespace,
            client,
        }
    }

    /// Delete every `servers/<executor>` entry and the executor's own subtree.
    /// Skipped if the executor came back online in the meantime.
    pub async fn clean(&self, executor: &str) {
        match self.try_clean(executor).await {
            Ok(true) => {
                tracing::info!(namespace = %self.namespace, executor, "Cleaned up offline executor")
            }
            Ok(false) => {
                tracing::debug!(namespace = %self.namespace, executor, "Executor back online, cleanup skipped")
            }
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, executor, error = %e, "Executor cleanup failed")
            }
        }
    }

    async fn try_clean(&self, executor: &str) -> Result<bool> {
        if self.client.exists(&self.paths.executor_ip(executor)).await? {
            return Ok(false);
        }

        let jobs = match self.client.children(&self.paths.jobs_root()).await {
            Ok(jobs) => jobs,
            Err(ShardingError::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for job in jobs {
            coordination::delete_recursive(
                self.client.as_ref(),
                &self.paths.job_server(&job, executor),
            )
            .await?;
        }

        coordination::delete_recursive(self.client.as_ref(), &self.paths.executor(executor))
            .await?;
        Ok(true)
    }
}
