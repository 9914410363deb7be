//! Error types for the local store.

use crate::lock::LockError;
use thiserror::Error;

/// Local store result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Local store errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Insert-once write hit an existing key
    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    /// Entity key was empty
    #[error("Entity key must not be empty")]
    NullKey,

    /// Store was used after `close()`
    #[error("Store is closed")]
    Closed,

    /// Lock file could not be acquired
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// SQLite error (statement, constraint, etc.)
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data does not decode
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DbError {
    /// Create an already exists error.
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists(key.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// True when the lock file is held by another agent.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Lock(LockError::Locked(_)))
    }
}
