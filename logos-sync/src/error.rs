//! Error types shared across the sync engine.
//!
//! Conflicting concurrent edits are not errors: they are resolved by
//! `(timestamp, user id)` ordering. Per-item batch rejections are reported as
//! [`RejectReason`](crate::protocol::RejectReason) values inside the
//! acknowledgement, not through these types.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::operation::Timestamp;

/// Result alias for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result alias for persistence operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence layer errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Workspace not found: {0}")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    /// A timestamp was read back twice or out of order.
    #[error("Log corrupted for workspace {workspace_id} at timestamp {timestamp}")]
    Corrupted { workspace_id: Uuid, timestamp: Timestamp },

    /// An append tried to reuse or go below the current high-water mark.
    #[error("Timestamp {timestamp} is not above high-water {high_water} in workspace {workspace_id}")]
    OutOfOrder {
        workspace_id: Uuid,
        timestamp: Timestamp,
        high_water: Timestamp,
    },

    #[error("Snapshot version {version} is not above latest {latest} in workspace {workspace_id}")]
    StaleSnapshot {
        workspace_id: Uuid,
        version: Timestamp,
        latest: Timestamp,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Wire protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level sync engine errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Batch of {size} items exceeds maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Room for workspace {0} is full")]
    RoomFull(Uuid),

    #[error("Connection has not joined a workspace")]
    NotJoined,

    #[error("Workspace mismatch: joined {joined}, request targets {requested}")]
    WorkspaceMismatch { joined: Uuid, requested: Uuid },

    #[error("Not connected to server")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Workspace {0} requires full resynchronization")]
    WorkspaceCorrupted(Uuid),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Sync engine is shut down")]
    Shutdown,
}

impl SyncError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Store(StoreError::Database(_))
                | SyncError::Store(StoreError::Unavailable(_))
                | SyncError::NotConnected
                | SyncError::Timeout
                | SyncError::WorkspaceCorrupted(_)
        )
    }
}
