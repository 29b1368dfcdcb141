//! Namespace-scoped coordination-tree layout.
//!
//! ```text
//! /<ns>/jobs/<job>/config              job configuration (JSON)
//! /<ns>/jobs/<job>/servers/<executor>  per-executor job state
//! /<ns>/jobs/<job>/assignment          published shard assignment (JSON)
//! /<ns>/executors/<executor>/ip        ephemeral executor presence
//! /<ns>/sharding/<trigger>             external re-sharding requests
//! /<ns>/leader/host                    ephemeral leadership marker
//! ```

const JOBS: &str = "jobs";
const EXECUTORS: &str = "executors";
const SHARDING: &str = "sharding";
const LEADER: &str = "leader";
const LEADER_HOST: &str = "host";
const CONFIG: &str = "config";
const SERVERS: &str = "servers";
const ASSIGNMENT: &str = "assignment";
const EXECUTOR_IP: &str = "ip";

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of an absolute path, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Number of path segments `path` sits below `root`, or `None` if it is not
/// inside `root`.
pub fn relative_depth(root: &str, path: &str) -> Option<usize> {
    if path == root {
        return Some(0);
    }
    let rest = if root == "/" {
        path.strip_prefix('/')?
    } else {
        path.strip_prefix(root)?.strip_prefix('/')?
    };
    if rest.is_empty() {
        return None;
    }
    Some(rest.split('/').count())
}

/// Validate an absolute node path: leading slash, no trailing slash, no empty
/// segments.
pub fn is_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty)
}

/// Paths for a single namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacePaths {
    root: String,
}

impl NamespacePaths {
    pub fn new(namespace: &str) -> Self {
        Self {
            root: format!("/{}", namespace.trim_matches('/')),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn jobs_root(&self) -> String {
        join(&self.root, JOBS)
    }

    pub fn executors_root(&self) -> String {
        join(&self.root, EXECUTORS)
    }

    pub fn sharding_root(&self) -> String {
        join(&self.root, SHARDING)
    }

    pub fn leader_root(&self) -> String {
        join(&self.root, LEADER)
    }

    pub fn leader_host(&self) -> String {
        join(&self.leader_root(), LEADER_HOST)
    }

    pub fn job(&self, job: &str) -> String {
        join(&self.jobs_root(), job)
    }

    pub fn job_config(&self, job: &str) -> String {
        join(&self.job(job), CONFIG)
    }

    pub fn job_servers(&self, job: &str) -> String {
        join(&self.job(job), SERVERS)
    }

    pub fn job_server(&self, job: &str, executor: &str) -> String {
        join(&self.job_servers(job), executor)
    }

    pub fn job_assignment(&self, job: &str) -> String {
        join(&self.job(job), ASSIGNMENT)
    }

    pub fn executor(&self, executor: &str) -> String {
        join(&self.executors_root(), executor)
    }

    pub fn executor_ip(&self, executor: &str) -> String {
        join(&self.executor(executor), EXECUTOR_IP)
    }

    /// `/<ns>/jobs/<job>` → `job`
    pub fn job_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        single_child(&self.jobs_root(), path)
    }

    /// `/<ns>/executors/<executor>/ip` → `executor`
    pub fn executor_from_ip<'a>(&self, path: &'a str) -> Option<&'a str> {
        let (executor, leaf) = two_children(&self.executors_root(), path)?;
        (leaf == EXECUTOR_IP).then_some(executor)
    }

    /// `/<ns>/sharding/<trigger>` → `trigger`
    pub fn sharding_trigger<'a>(&self, path: &'a str) -> Option<&'a str> {
        single_child(&self.sharding_root(), path)
    }

    pub fn is_leader_host(&self, path: &str) -> bool {
        path == self.leader_host()
    }
}

fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix(root)?.strip_prefix('/')
}

fn single_child<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let rest = strip_root(root, path)?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

fn two_children<'a>(root: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = strip_root(root, path)?;
    let (first, second) = rest.split_once('/')?;
    if first.is_empty() || second.is_empty() || second.contains('/') {
        return None;
    }
    Some((first, second))
}
