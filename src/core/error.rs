use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Replica is not ready")]
    NotReady,

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Transaction step {index} failed: {message}")]
    TransactionStep { index: usize, message: String },

    #[error("Migration '{tag}' failed: {message}")]
    Migration { tag: String, message: String },

    #[error("Invalid migration manifest: {0}")]
    InvalidManifest(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscription to '{table}' failed: {message}")]
    Subscription { table: String, message: String },

    #[error("Replica verification failed: {0}")]
    Verification(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Replica engine is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Connectivity-class failures: recorded as offline and retried on the
    /// next tick, never destructive.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Subscription { .. } | Self::Protocol(_)
        )
    }

    /// Failures after which the local replica can no longer be trusted.
    pub fn requires_reset(&self) -> bool {
        matches!(self, Self::Migration { .. } | Self::Verification(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Engine(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SyncError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Closed
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Engine(format!("lock poisoned: {}", err))
    }
}
