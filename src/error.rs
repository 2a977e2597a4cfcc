//! Error types for the knowledge-base engine.
//!
//! Library operations return [`Result<T>`] with a typed [`KbError`] so callers
//! can tell recoverable conditions (a busy database, a missing embedder) from
//! hard failures. Collaborator adapters and the CLI use `anyhow` internally and
//! are mapped onto these variants at the boundary.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, KbError>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum KbError {
    /// Lock/busy retries were exhausted for a write.
    #[error("write conflict in {operation}: gave up after {attempts} attempts")]
    WriteConflict { operation: String, attempts: u32 },

    /// The caller-supplied deadline passed before the operation finished.
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("rerank failed: {0}")]
    RerankFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KbError {
    /// Whether the error is a transient SQLite lock/busy condition that a
    /// retry may clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            KbError::Storage(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY = 5, SQLITE_LOCKED = 6, plus their extended codes.
                let primary = db
                    .code()
                    .and_then(|c| c.parse::<i64>().ok())
                    .map(|c| c & 0xff);
                matches!(primary, Some(5) | Some(6)) || is_lock_message(db.message())
            }
            KbError::Storage(sqlx::Error::PoolTimedOut) => true,
            KbError::Storage(other) => is_lock_message(&other.to_string()),
            _ => false,
        }
    }
}

fn is_lock_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("database is busy")
}
