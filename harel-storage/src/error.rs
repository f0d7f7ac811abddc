//! Storage error types.

use harel_core::PersistenceError;
use thiserror::Error;

/// Errors that can occur in the checkpoint stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

impl StorageError {
    /// Returns whether this error indicates damaged data rather than an
    /// environment failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::CorruptedRecord { .. }
                | StorageError::InvalidHeader { .. }
                | StorageError::RecordTooLarge { .. }
        )
    }
}

impl From<StorageError> for PersistenceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Json(e) => PersistenceError::Serialization(e),
            e if e.is_corruption() => PersistenceError::Corrupt {
                key: "snapshot".to_string(),
                reason: e.to_string(),
            },
            e => PersistenceError::Storage(e.to_string()),
        }
    }
}
