use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job configuration stored at `/<ns>/jobs/<job>/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub shard_total: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl JobConfig {
    pub fn new(shard_total: u32) -> Self {
        Self {
            shard_total,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Shard items per executor for one job, published at
/// `/<ns>/jobs/<job>/assignment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job: String,
    pub leader: String,
    pub items: BTreeMap<String, Vec<u32>>,
    pub generated_at: DateTime<Utc>,
}

impl JobAssignment {
    /// Executor holding `item`, if any.
    pub fn owner_of(&self, item: u32) -> Option<&str> {
        self.items
            .iter()
            .find(|(_, items)| items.contains(&item))
            .map(|(executor, _)| executor.as_str())
    }

    pub fn assigned_count(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }
}

/// Spread every enabled job's shard items across `executors`, round-robin.
///
/// Jobs and executors are processed in sorted order and the rotation carries
/// over from one job to the next, so single-shard jobs do not all land on the
/// same executor. Disabled jobs get no entry; with no executors every enabled
/// job gets an empty map.
pub fn allocate(
    jobs: &BTreeMap<String, JobConfig>,
    executors: &[String],
) -> BTreeMap<String, BTreeMap<String, Vec<u32>>> {
    let mut executors: Vec<&String> = executors.iter().collect();
    executors.sort();
    executors.dedup();

    let mut cursor = 0usize;
    let mut result = BTreeMap::new();

    for (job, config) in jobs.iter().filter(|(_, c)| c.enabled) {
        let mut items: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        if !executors.is_empty() {
            for item in 0..config.shard_total {
                let executor = executors[cursor % executors.len()];
                items.entry(executor.clone()).or_default().push(item);
                cursor += 1;
            }
        }
        result.insert(job.clone(), items);
    }

    result
}
