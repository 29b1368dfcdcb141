use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardingError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Watch service is not running")]
    WatchServiceStopped,

    #[error("No watch registered at {0}")]
    WatchNotRegistered(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardingError {
    /// Errors that are expected to clear up on their own once the session is
    /// re-established or another host finishes its change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShardingError::ConnectionLoss
                | ShardingError::NoNode(_)
                | ShardingError::NodeExists(_)
                | ShardingError::NotEmpty(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShardingError>;
