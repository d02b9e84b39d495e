//! Error types for snapshot persistence and conversation directories.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for kvsession-store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot not found: {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("snapshot {} is corrupt: {reason}", path.display())]
    SnapshotCorrupt { path: PathBuf, reason: String },

    #[error("cannot modify active conversation '{0}'")]
    ActiveSessionConflict(String),

    #[error("conversation name '{0}' already exists")]
    NameCollision(String),

    #[error("conversation '{name}' does not exist for user '{username}'")]
    ConversationNotFound { username: String, name: String },

    #[error("no sessions found for user '{0}'")]
    UserNotFound(String),

    #[error("invalid name: '{0}'")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
