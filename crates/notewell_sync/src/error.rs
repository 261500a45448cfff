use thiserror::Error;

/// Unified error type for the sync engine.
///
/// Only *fatal-local* conditions surface as `Err` from normal operation:
/// the engine cannot proceed without a working local persistence substrate.
/// Recoverable remote failures are recorded into [`SyncState`](crate::types::SyncState)
/// or drain reports instead of being propagated as errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// IO failure in the local persistence layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite failure in the local persistence layer.
    #[cfg(not(target_arch = "wasm32"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A custom local store implementation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Failed to decode or apply a CRDT update.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// Failed to encode or decode a queue payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
