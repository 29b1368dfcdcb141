//! Connection-loss handling.
//!
//! The coordination client reports state changes synchronously on its own
//! dispatch path. [`ConnectionLostListener`] only records the change and
//! queues a recovery action; a dedicated task runs those actions one at a
//! time against a [`Recoverable`] target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordination::{ConnectionState, ConnectionStateListener};
use crate::error::Result;

/// Something that can be torn down on session loss and rebuilt afterwards.
#[async_trait]
pub trait Recoverable: Send + Sync + 'static {
    async fn stop(&self);

    async fn restart(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryAction {
    Stop,
    Restart,
}

pub struct ConnectionLostListener {
    namespace: String,
    actions: mpsc::Sender<RecoveryAction>,
    /// Set on `Lost`, consumed by the next `Reconnected`.
    lost: AtomicBool,
    token: CancellationToken,
}

impl ConnectionLostListener {
    /// Create the listener and spawn its recovery task.
    pub fn spawn(
        namespace: impl Into<String>,
        target: Arc<dyn Recoverable>,
        capacity: usize,
    ) -> Arc<Self> {
        let namespace = namespace.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();

        tokio::spawn(run_recovery(namespace.clone(), target, rx, token.clone()));

        Arc::new(Self {
            namespace,
            actions: tx,
            lost: AtomicBool::new(false),
            token,
        })
    }

    /// Stop the recovery task. An action already running completes.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn enqueue(&self, action: RecoveryAction) {
        if let Err(e) = self.actions.try_send(action) {
            tracing::warn!(namespace = %self.namespace, ?action, error = %e, "Recovery action dropped");
        }
    }
}

impl ConnectionStateListener for ConnectionLostListener {
    fn state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Lost => {
                tracing::warn!(namespace = %self.namespace, "Session lost");
                self.lost.store(true, Ordering::SeqCst);
                self.enqueue(RecoveryAction::Stop);
            }
            ConnectionState::Reconnected => {
                if self
                    .lost
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    tracing::info!(namespace = %self.namespace, "Session restored");
                    self.enqueue(RecoveryAction::Restart);
                } else {
                    tracing::debug!(namespace = %self.namespace, "Reconnected with session intact");
                }
            }
            ConnectionState::Suspended | ConnectionState::Connected => {
                tracing::debug!(namespace = %self.namespace, %state, "Connection state changed");
            }
        }
    }
}

async fn run_recovery(
    namespace: String,
    target: Arc<dyn Recoverable>,
    mut actions: mpsc::Receiver<RecoveryAction>,
    token: CancellationToken,
) {
    loop {
        let action = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            action = actions.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        match action {
            RecoveryAction::Stop => {
                target.stop().await;
                tracing::info!(namespace = %namespace, "Stopped after session loss");
            }
            RecoveryAction::Restart => match target.restart().await {
                Ok(()) => tracing::info!(namespace = %namespace, "Restarted after session restore"),
                Err(e) => {
                    tracing::warn!(namespace = %namespace, error = %e, "Restart after session restore failed")
                }
            },
        }
    }
    tracing::debug!(namespace = %namespace, "Recovery task stopped");
}
