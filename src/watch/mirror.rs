use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::coordination::{CoordinationClient, NodeEvent, NodeEventKind};
use crate::error::{Result, ShardingError};
use crate::paths;
use crate::watch::TreeListener;

/// Listener attached to one watched path. Only the first attach succeeds.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    listener: OnceLock<Arc<dyn TreeListener>>,
    attached: Notify,
}

impl ListenerSlot {
    pub(crate) fn attach(&self, listener: Arc<dyn TreeListener>) -> bool {
        let attached = self.listener.set(listener).is_ok();
        if attached {
            // Stores a permit if the mirror is not waiting yet
            self.attached.notify_one();
        }
        attached
    }

    pub(crate) fn get(&self) -> Option<&Arc<dyn TreeListener>> {
        self.listener.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    Added(String, Vec<u8>),
    Updated(String, Vec<u8>),
    Removed(String),
}

/// Local copy of a depth-bounded subtree.
#[derive(Debug)]
pub(crate) struct Mirror {
    root: String,
    depth: usize,
    nodes: HashMap<String, Vec<u8>>,
}

impl Mirror {
    pub(crate) fn new(root: &str, depth: usize, nodes: HashMap<String, Vec<u8>>) -> Self {
        Self {
            root: root.to_string(),
            depth,
            nodes,
        }
    }

    fn covers(&self, path: &str) -> bool {
        paths::relative_depth(&self.root, path).is_some_and(|d| d <= self.depth)
    }

    /// Fold a change-stream event into the mirror. Returns the change to
    /// report, or `None` if the event is outside the subtree or already
    /// reflected.
    pub(crate) fn apply(&mut self, event: &NodeEvent) -> Option<Change> {
        if !self.covers(&event.path) {
            return None;
        }
        match event.kind {
            NodeEventKind::Created | NodeEventKind::DataChanged => {
                match self.nodes.get(&event.path) {
                    Some(existing) if *existing == event.data => None,
                    Some(_) => {
                        self.nodes.insert(event.path.clone(), event.data.clone());
                        Some(Change::Updated(event.path.clone(), event.data.clone()))
                    }
                    None => {
                        self.nodes.insert(event.path.clone(), event.data.clone());
                        Some(Change::Added(event.path.clone(), event.data.clone()))
                    }
                }
            }
            NodeEventKind::Deleted => self
                .nodes
                .remove(&event.path)
                .map(|_| Change::Removed(event.path.clone())),
        }
    }

    /// Replace the mirror with a fresh snapshot and return what changed.
    /// Removals come first, deepest path first.
    pub(crate) fn resync(&mut self, snapshot: HashMap<String, Vec<u8>>) -> Vec<Change> {
        let mut removed: Vec<String> = self
            .nodes
            .keys()
            .filter(|path| !snapshot.contains_key(*path))
            .cloned()
            .collect();
        removed.sort_unstable_by(|a, b| b.cmp(a));

        let mut current: Vec<(&String, &Vec<u8>)> = snapshot.iter().collect();
        current.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut changes: Vec<Change> = removed.into_iter().map(Change::Removed).collect();
        for (path, data) in current {
            match self.nodes.get(path) {
                None => changes.push(Change::Added(path.clone(), data.clone())),
                Some(existing) if existing != data => {
                    changes.push(Change::Updated(path.clone(), data.clone()))
                }
                Some(_) => {}
            }
        }

        self.nodes = snapshot;
        changes
    }
}

/// Read `root` and its descendants down to `depth`. A missing root yields an
/// empty snapshot.
pub(crate) async fn load_snapshot(
    client: &dyn CoordinationClient,
    root: &str,
    depth: usize,
) -> Result<HashMap<String, Vec<u8>>> {
    let mut snapshot = HashMap::new();
    let Some(data) = client.get_data(root).await? else {
        return Ok(snapshot);
    };
    snapshot.insert(root.to_string(), data);

    let mut frontier = vec![root.to_string()];
    for _ in 0..depth {
        let mut next = Vec::new();
        for parent in &frontier {
            let children = match client.children(parent).await {
                Ok(children) => children,
                // Deleted while we were walking
                Err(ShardingError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            for child in children {
                let path = paths::join(parent, &child);
                if let Some(data) = client.get_data(&path).await? {
                    snapshot.insert(path.clone(), data);
                    next.push(path);
                }
            }
        }
        frontier = next;
    }

    Ok(snapshot)
}

async fn dispatch(listener: &dyn TreeListener, change: Change) {
    match change {
        Change::Added(path, data) => listener.on_add(&path, &data).await,
        Change::Updated(path, data) => listener.on_update(&path, &data).await,
        Change::Removed(path) => listener.on_remove(&path).await,
    }
}

/// Report `change`, or hold it until a listener is attached.
async fn deliver(slot: &ListenerSlot, held: &mut Vec<Change>, change: Change) {
    match slot.get() {
        Some(listener) => dispatch(listener.as_ref(), change).await,
        None => held.push(change),
    }
}

/// Mirror event loop. Runs until `token` is cancelled or the change stream
/// closes. A callback in progress always completes.
///
/// Changes seen before a listener is attached are held and reported, in
/// order, once one is.
pub(crate) async fn run(
    mut mirror: Mirror,
    mut events: broadcast::Receiver<NodeEvent>,
    client: Arc<dyn CoordinationClient>,
    slot: Arc<ListenerSlot>,
    token: CancellationToken,
) {
    let mut held = Vec::new();
    loop {
        if !held.is_empty() {
            if let Some(listener) = slot.get() {
                for change in held.drain(..) {
                    dispatch(listener.as_ref(), change).await;
                }
            }
        }

        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = slot.attached.notified() => continue,
            received = events.recv() => received,
        };

        match received {
            Ok(event) => {
                if let Some(change) = mirror.apply(&event) {
                    deliver(&slot, &mut held, change).await;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    path = %mirror.root,
                    skipped,
                    "Change stream lagged, resynchronizing mirror"
                );
                match load_snapshot(client.as_ref(), &mirror.root, mirror.depth).await {
                    Ok(snapshot) => {
                        for change in mirror.resync(snapshot) {
                            deliver(&slot, &mut held, change).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %mirror.root, error = %e, "Mirror resync failed");
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!(path = %mirror.root, "Mirror stopped");
}
