//! In-process coordination service.
//!
//! A [`MemoryCoordinator`] owns one shared node tree; every
//! [`MemoryCoordinator::connect`] call opens an independent session on it, so
//! several controllers (one per simulated host) can contend for leadership the
//! same way they would against a real ensemble. Session faults are injected
//! through [`MemoryClient::suspend`], [`MemoryClient::expire_session`] and
//! [`MemoryClient::reconnect`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::coordination::{
    ConnectionState, ConnectionStateListener, CoordinationClient, CreateMode, ListenerId,
    NodeEvent, NodeEventKind,
};
use crate::error::{Result, ShardingError};
use crate::paths;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

struct Shared {
    nodes: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<NodeEvent>,
    next_session: AtomicU64,
}

impl Shared {
    /// Publish while the tree lock is held so subscribers observe changes in
    /// mutation order.
    fn publish(&self, path: &str, kind: NodeEventKind, data: Vec<u8>) {
        // No receivers is fine
        let _ = self.events.send(NodeEvent {
            path: path.to_string(),
            kind,
            data,
        });
    }
}

/// Shared in-memory node tree.
#[derive(Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
            },
        );

        Self {
            shared: Arc::new(Shared {
                nodes: Mutex::new(nodes),
                events,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session.
    pub fn connect(&self) -> Arc<MemoryClient> {
        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session_id = id, "Session opened");
        Arc::new(MemoryClient {
            shared: self.shared.clone(),
            session: Mutex::new(Session {
                id,
                connected: true,
                expired: false,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.shared.nodes.lock().len()
    }
}

#[derive(Debug)]
struct Session {
    id: u64,
    connected: bool,
    expired: bool,
}

/// One session on a [`MemoryCoordinator`].
pub struct MemoryClient {
    shared: Arc<Shared>,
    session: Mutex<Session>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ConnectionStateListener>)>>,
    next_listener: AtomicU64,
}

impl MemoryClient {
    pub fn session_id(&self) -> u64 {
        self.session.lock().id
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().connected
    }

    pub fn connection_listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Drop the connection without losing the session.
    pub fn suspend(&self) {
        {
            let mut session = self.session.lock();
            if !session.connected {
                return;
            }
            session.connected = false;
        }
        tracing::info!(session_id = self.session_id(), "Connection suspended");
        self.notify(ConnectionState::Suspended);
    }

    /// Expire the session: its ephemeral nodes are deleted and listeners are
    /// told the session is lost.
    pub fn expire_session(&self) {
        let session_id = {
            let mut session = self.session.lock();
            if session.expired {
                return;
            }
            session.connected = false;
            session.expired = true;
            session.id
        };
        let removed = self.remove_ephemerals(session_id);
        tracing::info!(session_id, removed, "Session expired");
        self.notify(ConnectionState::Lost);
    }

    /// Re-establish the connection. An expired session is replaced by a new
    /// one.
    pub fn reconnect(&self) {
        {
            let mut session = self.session.lock();
            if session.connected {
                return;
            }
            if session.expired {
                session.id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
                session.expired = false;
            }
            session.connected = true;
        }
        tracing::info!(session_id = self.session_id(), "Connection re-established");
        self.notify(ConnectionState::Reconnected);
    }

    /// Close the session cleanly. Ephemeral nodes are removed; listeners are
    /// not notified.
    pub fn close(&self) {
        let session_id = {
            let mut session = self.session.lock();
            session.connected = false;
            session.expired = true;
            session.id
        };
        self.remove_ephemerals(session_id);
    }

    fn remove_ephemerals(&self, session_id: u64) -> usize {
        let mut nodes = self.shared.nodes.lock();
        let owned: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            nodes.remove(path);
            self.shared.publish(path, NodeEventKind::Deleted, Vec::new());
        }
        owned.len()
    }

    fn notify(&self, state: ConnectionState) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.state_changed(state);
        }
    }

    fn check_connected(&self) -> Result<u64> {
        let session = self.session.lock();
        if session.connected {
            Ok(session.id)
        } else {
            Err(ShardingError::ConnectionLoss)
        }
    }
}

fn check_path(path: &str) -> Result<()> {
    if paths::is_valid(path) {
        Ok(())
    } else {
        Err(ShardingError::InvalidPath(path.to_string()))
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn child_names(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn exists(&self, path: &str) -> Result<bool> {
        check_path(path)?;
        self.check_connected()?;
        Ok(self.shared.nodes.lock().contains_key(path))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        check_path(path)?;
        let session_id = self.check_connected()?;
        if path == "/" {
            return Err(ShardingError::NodeExists(path.to_string()));
        }

        let mut nodes = self.shared.nodes.lock();
        if nodes.contains_key(path) {
            return Err(ShardingError::NodeExists(path.to_string()));
        }

        // Collect missing ancestors, nearest first
        let mut missing = Vec::new();
        let mut cursor = paths::parent(path);
        while let Some(ancestor) = cursor {
            match nodes.get(ancestor) {
                Some(node) if node.owner.is_some() => {
                    return Err(ShardingError::InvalidPath(format!(
                        "{} has an ephemeral parent",
                        path
                    )));
                }
                Some(_) => break,
                None => missing.push(ancestor.to_string()),
            }
            cursor = paths::parent(ancestor);
        }

        for ancestor in missing.iter().rev() {
            nodes.insert(
                ancestor.clone(),
                Node {
                    data: Vec::new(),
                    owner: None,
                },
            );
            self.shared
                .publish(ancestor, NodeEventKind::Created, Vec::new());
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session_id),
        };
        nodes.insert(
            path.to_string(),
            Node {
                data: data.clone(),
                owner,
            },
        );
        self.shared.publish(path, NodeEventKind::Created, data);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        check_path(path)?;
        self.check_connected()?;
        Ok(self.shared.nodes.lock().get(path).map(|n| n.data.clone()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        check_path(path)?;
        self.check_connected()?;
        let mut nodes = self.shared.nodes.lock();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| ShardingError::NoNode(path.to_string()))?;
        node.data = data.clone();
        self.shared.publish(path, NodeEventKind::DataChanged, data);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        check_path(path)?;
        self.check_connected()?;
        let nodes = self.shared.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(ShardingError::NoNode(path.to_string()));
        }
        Ok(child_names(&nodes, path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        check_path(path)?;
        self.check_connected()?;
        if path == "/" {
            return Err(ShardingError::InvalidPath(path.to_string()));
        }
        let mut nodes = self.shared.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(ShardingError::NoNode(path.to_string()));
        }
        if !child_names(&nodes, path).is_empty() {
            return Err(ShardingError::NotEmpty(path.to_string()));
        }
        nodes.remove(path);
        self.shared.publish(path, NodeEventKind::Deleted, Vec::new());
        Ok(())
    }

    fn node_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionStateListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_connection_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}
