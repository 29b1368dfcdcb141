use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::coordination::{self, CoordinationClient, CreateMode};
use crate::error::{Result, ShardingError};
use crate::paths::NamespacePaths;
use crate::sharding::allocate::{allocate, JobAssignment, JobConfig};

/// Reasons to recompute the namespace's shard assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingEvent {
    LeaderElected,
    JobAdded(String),
    JobRemoved(String),
    JobConfigChanged(String),
    ExecutorOnline(String),
    ExecutorOffline(String),
    Requested { trigger: String },
}

impl std::fmt::Display for ShardingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardingEvent::LeaderElected => write!(f, "leader elected"),
            ShardingEvent::JobAdded(job) => write!(f, "job {} added", job),
            ShardingEvent::JobRemoved(job) => write!(f, "job {} removed", job),
            ShardingEvent::JobConfigChanged(job) => write!(f, "job {} config changed", job),
            ShardingEvent::ExecutorOnline(e) => write!(f, "executor {} online", e),
            ShardingEvent::ExecutorOffline(e) => write!(f, "executor {} offline", e),
            ShardingEvent::Requested { trigger } => write!(f, "requested via {}", trigger),
        }
    }
}

struct Worker {
    tx: mpsc::Sender<ShardingEvent>,
    token: CancellationToken,
}

/// State shared with the sharding worker task.
struct ShardingCore {
    namespace: String,
    host: String,
    paths: NamespacePaths,
    client: Arc<dyn CoordinationClient>,
    leader: AtomicBool,
    rounds: AtomicU64,
}

/// Leader election and shard assignment for one namespace.
///
/// Leadership is an ephemeral `/<ns>/leader/host` node holding the host value.
/// Only the leader's worker publishes assignments; other hosts drop the
/// events they receive.
pub struct ShardingService {
    core: Arc<ShardingCore>,
    queue_capacity: usize,
    worker: Mutex<Option<Worker>>,
}

impl ShardingService {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        namespace: impl Into<String>,
        config: &ControllerConfig,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            core: Arc::new(ShardingCore {
                paths: NamespacePaths::new(&namespace),
                namespace,
                host: config.host.clone(),
                client,
                leader: AtomicBool::new(false),
                rounds: AtomicU64::new(0),
            }),
            // mpsc::channel panics on zero
            queue_capacity: config.sharding_queue_capacity.max(1),
            worker: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.core.host
    }

    pub fn namespace(&self) -> &str {
        &self.core.namespace
    }

    pub fn is_leader(&self) -> bool {
        self.core.leader.load(Ordering::SeqCst)
    }

    /// Number of sharding rounds this host has completed as leader.
    pub fn completed_rounds(&self) -> u64 {
        self.core.rounds.load(Ordering::SeqCst)
    }

    /// Host value currently held in the leadership marker.
    pub async fn current_leader(&self) -> Result<Option<String>> {
        let data = self
            .core
            .client
            .get_data(&self.core.paths.leader_host())
            .await?;
        Ok(data.map(|d| String::from_utf8_lossy(&d).into_owned()))
    }

    /// Contend for leadership. Never waits for the current leader to step
    /// down; a later removal of the marker is observed through the leader
    /// watch, which calls this again.
    pub async fn elect_leader(&self) {
        self.ensure_worker();

        let core = &self.core;
        let path = core.paths.leader_host();
        match core
            .client
            .create(&path, core.host.as_bytes().to_vec(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {
                core.leader.store(true, Ordering::SeqCst);
                tracing::info!(namespace = %core.namespace, host = %core.host, "Became leader");
                self.trigger_sharding(ShardingEvent::LeaderElected);
            }
            Err(ShardingError::NodeExists(_)) => match core.client.get_data(&path).await {
                Ok(Some(data)) if data == core.host.as_bytes() => {
                    core.leader.store(true, Ordering::SeqCst);
                    tracing::debug!(namespace = %core.namespace, "Already holding leadership");
                }
                Ok(data) => {
                    core.leader.store(false, Ordering::SeqCst);
                    tracing::debug!(
                        namespace = %core.namespace,
                        leader = %data.map(|d| String::from_utf8_lossy(&d).into_owned()).unwrap_or_default(),
                        "Another host holds leadership"
                    );
                }
                Err(e) => {
                    core.leader.store(false, Ordering::SeqCst);
                    tracing::warn!(namespace = %core.namespace, error = %e, "Failed to read leadership marker");
                }
            },
            Err(e) => {
                core.leader.store(false, Ordering::SeqCst);
                tracing::warn!(namespace = %core.namespace, error = %e, "Leader election failed");
            }
        }
    }

    /// Queue a sharding request. Never blocks: the event is dropped if the
    /// worker is not running or its queue is full.
    pub fn trigger_sharding(&self, event: ShardingEvent) {
        let worker = self.worker.lock();
        match worker.as_ref() {
            Some(worker) => {
                if let Err(e) = worker.tx.try_send(event) {
                    tracing::debug!(namespace = %self.core.namespace, error = %e, "Sharding event dropped");
                }
            }
            None => {
                tracing::debug!(namespace = %self.core.namespace, %event, "Sharding worker not running, event dropped");
            }
        }
    }

    /// Stop the worker and release leadership. Best-effort.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
        }

        let core = &self.core;
        if !core.leader.swap(false, Ordering::SeqCst) {
            return;
        }

        let path = core.paths.leader_host();
        let released = match core.client.get_data(&path).await {
            Ok(Some(data)) if data == core.host.as_bytes() => core.client.delete(&path).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        match released {
            Ok(()) => {
                tracing::info!(namespace = %core.namespace, host = %core.host, "Released leadership")
            }
            Err(ShardingError::NoNode(_)) => {}
            Err(e) => {
                tracing::debug!(namespace = %core.namespace, error = %e, "Could not release leadership marker")
            }
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let token = CancellationToken::new();
        tokio::spawn(run_worker(self.core.clone(), rx, token.clone()));
        *worker = Some(Worker { tx, token });
    }
}

async fn run_worker(
    core: Arc<ShardingCore>,
    mut rx: mpsc::Receiver<ShardingEvent>,
    token: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        // Coalesce everything already queued into one round
        let mut pending = 1usize;
        while rx.try_recv().is_ok() {
            pending += 1;
        }

        if !core.leader.load(Ordering::SeqCst) {
            tracing::trace!(namespace = %core.namespace, %first, "Not leader, skipping sharding");
            continue;
        }

        match core.reshard().await {
            Ok(jobs) => {
                let round = core.rounds.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(
                    namespace = %core.namespace,
                    round,
                    jobs,
                    events = pending,
                    cause = %first,
                    "Sharding round completed"
                );
            }
            Err(e) => {
                tracing::warn!(namespace = %core.namespace, error = %e, "Sharding round failed");
            }
        }
    }
    tracing::debug!(namespace = %core.namespace, "Sharding worker stopped");
}

impl ShardingCore {
    /// Recompute and publish every enabled job's assignment. Returns the
    /// number of assignments written.
    async fn reshard(&self) -> Result<usize> {
        let jobs = self.read_jobs().await?;
        let executors = self.online_executors().await?;
        let allocation = allocate(&jobs, &executors);

        let mut written = 0;
        for (job, items) in allocation {
            // Do not resurrect a job removed since we listed it
            if !self.client.exists(&self.paths.job(&job)).await? {
                continue;
            }
            let assignment = JobAssignment {
                job: job.clone(),
                leader: self.host.clone(),
                items,
                generated_at: Utc::now(),
            };
            let data = serde_json::to_vec(&assignment)?;
            coordination::upsert(self.client.as_ref(), &self.paths.job_assignment(&job), data)
                .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn read_jobs(&self) -> Result<BTreeMap<String, JobConfig>> {
        let names = match self.client.children(&self.paths.jobs_root()).await {
            Ok(names) => names,
            Err(ShardingError::NoNode(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut jobs = BTreeMap::new();
        for name in names {
            let Some(data) = self.client.get_data(&self.paths.job_config(&name)).await? else {
                continue;
            };
            match serde_json::from_slice::<JobConfig>(&data) {
                Ok(config) => {
                    jobs.insert(name, config);
                }
                Err(e) => {
                    tracing::warn!(namespace = %self.namespace, job = %name, error = %e, "Ignoring job with invalid config");
                }
            }
        }
        Ok(jobs)
    }

    async fn online_executors(&self) -> Result<Vec<String>> {
        let names = match self.client.children(&self.paths.executors_root()).await {
            Ok(names) => names,
            Err(ShardingError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut online = Vec::new();
        for name in names {
            if self.client.exists(&self.paths.executor_ip(&name)).await? {
                online.push(name);
            }
        }
        Ok(online)
    }
}
