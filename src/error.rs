use thiserror::Error;

/// Errors raised by the cluster core.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A peer sent a sync event this node does not understand. Nodes in the
    /// same cluster must speak the same protocol version, so this is fatal.
    #[error("Unknown sync event received: {0}")]
    UnknownSyncEvent(String),

    #[error("Node is not connected to the cluster")]
    NotReady,
}

impl From<redis::RedisError> for ClusterError {
    fn from(err: redis::RedisError) -> Self {
        ClusterError::Store(err.to_string())
    }
}

impl From<mlua::Error> for ClusterError {
    fn from(err: mlua::Error) -> Self {
        ClusterError::Script(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
