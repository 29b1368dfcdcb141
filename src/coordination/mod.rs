//! Client contract for the hierarchical coordination service.
//!
//! The controller never talks to a concrete service directly; everything goes
//! through [`CoordinationClient`]. [`memory`] provides an in-process
//! implementation with session control used by the binary and the tests.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Result, ShardingError};

pub use memory::{MemoryClient, MemoryCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted by the service when the creating session ends.
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    DataChanged,
    Deleted,
}

/// A change to a single node, as published on the client's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub path: String,
    pub kind: NodeEventKind,
    /// Node data after the change; empty for deletions.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection interrupted; the session may still be alive.
    Suspended,
    /// Session expired. Every ephemeral node of the session is gone.
    Lost,
    /// Connection re-established after `Suspended` or `Lost`.
    Reconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Suspended => write!(f, "suspended"),
            ConnectionState::Lost => write!(f, "lost"),
            ConnectionState::Reconnected => write!(f, "reconnected"),
        }
    }
}

/// Receives connection-state transitions. Called on the client's dispatch
/// path, so implementations must return quickly and never block.
pub trait ConnectionStateListener: Send + Sync {
    fn state_changed(&self, state: ConnectionState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a node, creating missing parents as persistent nodes.
    /// Fails with `NodeExists` if the node is already present.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

    /// Node data, or `None` if the node does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Child names (not full paths), sorted. Fails with `NoNode` if missing.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a leaf node. Fails with `NoNode` or `NotEmpty`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Subscribe to node changes across the whole tree.
    fn node_events(&self) -> broadcast::Receiver<NodeEvent>;

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionStateListener>) -> ListenerId;

    fn remove_connection_listener(&self, id: ListenerId) -> bool;
}

/// Delete `path` and everything below it. A node that is already gone is not
/// an error.
pub async fn delete_recursive(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    let mut stack = vec![path.to_string()];
    let mut order = Vec::new();

    while let Some(current) = stack.pop() {
        match client.children(&current).await {
            Ok(children) => {
                for child in children {
                    stack.push(crate::paths::join(&current, &child));
                }
                order.push(current);
            }
            Err(ShardingError::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
    }

    // Parents were pushed before their children
    for node in order.iter().rev() {
        match client.delete(node).await {
            Ok(()) | Err(ShardingError::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create `path` as a persistent node unless it already exists.
pub async fn create_if_absent(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    if client.exists(path).await? {
        return Ok(());
    }
    match client.create(path, Vec::new(), CreateMode::Persistent).await {
        Ok(()) | Err(ShardingError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write `data` to `path`, creating the node if needed.
pub async fn upsert(client: &dyn CoordinationClient, path: &str, data: Vec<u8>) -> Result<()> {
    match client.set_data(path, data.clone()).await {
        Err(ShardingError::NoNode(_)) => {
            match client.create(path, data.clone(), CreateMode::Persistent).await {
                Err(ShardingError::NodeExists(_)) => client.set_data(path, data).await,
                other => other,
            }
        }
        other => other,
    }
}
