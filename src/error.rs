//! Error types for agentmesh.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection to {0} closed")]
    ConnectionClosed(String),

    #[error("Timed out waiting for response to message with correlation id {correlation_id}")]
    Timeout { correlation_id: i64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync channel error: {0}")]
    SyncChannel(String),

    #[error("Sync communication rejected: {0}")]
    Rejected(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Not the main container: {0}")]
    NotMain(String),
}

impl Error {
    /// Whether the caller may reasonably retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rejected(_) | Error::Timeout { .. } | Error::ConnectionClosed(_) | Error::Transport(_)
        )
    }
}
