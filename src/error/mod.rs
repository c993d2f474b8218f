use thiserror::Error;

/// 协调服务客户端返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid coordination path: {0}")]
    InvalidPath(String),

    #[error("connection lost: {0}")]
    ConnectionLoss(String),
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Stale write on {path}: persisted {persisted}, supplied {supplied}")]
    StaleWrite {
        path: String,
        persisted: String,
        supplied: String,
    },

    #[error("Failed to acquire lock {name} on {path}: {reason}")]
    LockAcquisition {
        name: String,
        path: String,
        reason: String,
    },

    #[error("Lease on {path} is owned by {owner}")]
    LockOwnership { path: String, owner: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("File system unavailable: {0}")]
    State(String),
}

impl FsError {
    /// 是否为协调服务连接丢失
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, FsError::Coordination(CoordinationError::ConnectionLoss(_)))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
