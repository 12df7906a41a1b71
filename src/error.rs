//! Error types for memori

use thiserror::Error;

/// Result type alias for memori operations
pub type Result<T> = std::result::Result<T, MemoriError>;

/// Main error type for memori
#[derive(Error, Debug)]
pub enum MemoriError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient storage error: {0}")]
    StorageTransient(String),

    #[error("Fatal storage error: {0}")]
    StorageFatal(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Processing client unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Processing client returned malformed output: {0}")]
    ClassifierMalformed(String),

    #[error("Retrieval planner exceeded its budget of {0}ms")]
    PlannerTimeout(u64),

    #[error("Interceptor attach failure: {0}")]
    InterceptorAttach(String),

    #[error("Capture queue at capacity, exchange dropped")]
    QueueOverflow,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Not enabled")]
    NotEnabled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "openai")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "openai"))]
    Http(String),
}

impl MemoriError {
    /// Transient errors are retried internally with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoriError::StorageTransient(_) | MemoriError::Http(_)
        )
    }

    /// Fatal errors transition the coordinator to disabled.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemoriError::StorageFatal(_))
    }

    /// Errors on the classification path that degrade to the rule-based
    /// fallback instead of propagating.
    pub fn degrades_to_fallback(&self) -> bool {
        matches!(
            self,
            MemoriError::ClassifierUnavailable(_)
                | MemoriError::ClassifierMalformed(_)
                | MemoriError::PlannerTimeout(_)
        )
    }
}

impl From<rusqlite::Error> for MemoriError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    MemoriError::StorageTransient(
                        msg.clone().unwrap_or_else(|| code.to_string()),
                    )
                }
                rusqlite::ErrorCode::ConstraintViolation => MemoriError::StorageConflict(
                    msg.clone().unwrap_or_else(|| code.to_string()),
                ),
                rusqlite::ErrorCode::DiskFull
                | rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::PermissionDenied
                | rusqlite::ErrorCode::NotADatabase
                | rusqlite::ErrorCode::DatabaseCorrupt => {
                    MemoriError::StorageFatal(msg.clone().unwrap_or_else(|| code.to_string()))
                }
                _ => MemoriError::StorageTransient(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => {
                MemoriError::NotFound("query returned no rows".to_string())
            }
            _ => MemoriError::StorageFatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_transient() {
        let err: MemoriError = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        )
        .into();
        assert!(matches!(err, MemoriError::StorageTransient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn constraint_maps_to_conflict() {
        let err: MemoriError = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: long_term_memory.memory_id".to_string()),
        )
        .into();
        assert!(matches!(err, MemoriError::StorageConflict(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn corrupt_maps_to_fatal() {
        let err: MemoriError = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        )
        .into();
        assert!(err.is_fatal());
    }
}
