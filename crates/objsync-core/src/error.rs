//! Error types for objsync-core

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias using objsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in objsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// No such partner, collection or state
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filter conditions reference an unknown field or are malformed
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Backing store is unreachable (busy, locked, cannot be opened)
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The compare-and-set on a collection watermark lost a race
    #[error("Concurrent advance on collection {collection_id}: stored {stored}, attempted {attempted}")]
    ConcurrentAdvance {
        /// Collection whose watermark moved underneath us
        collection_id: i64,
        /// Watermark found in storage
        stored: i64,
        /// Watermark we tried to write
        attempted: i64,
    },

    /// Operation is not valid for this kind of collection
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database error that is not an availability problem
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary state codec error
    #[error("Codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Returns true if the caller should re-read and recompute instead of failing.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentAdvance { .. })
    }

    /// Returns true if the error must be surfaced to the caller as a hard failure.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::Database(_) | Self::Io(_)
        )
    }

    /// Returns true for "nothing there" conditions.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::ReadOnly,
            ) => Self::StorageUnavailable(error.to_string()),
            _ => Self::Database(error),
        }
    }
}

/// Returns true if the SQLite error is a uniqueness/constraint violation.
pub(crate) fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    error.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn busy_database_is_storage_unavailable() {
        let error = Error::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(matches!(error, Error::StorageUnavailable(_)));
        assert!(error.is_fatal());
        assert!(!error.is_retryable());
    }

    #[test]
    fn constraint_violation_stays_database_error() {
        let raw = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT);
        assert!(is_constraint_violation(&raw));
        assert!(matches!(Error::from(raw), Error::Database(_)));
    }

    #[test]
    fn concurrent_advance_is_retryable() {
        let error = Error::ConcurrentAdvance {
            collection_id: 7,
            stored: 14,
            attempted: 12,
        };
        assert!(error.is_retryable());
        assert!(!error.is_fatal());
        assert!(error.to_string().contains("stored 14"));
    }

    #[test]
    fn not_found_is_not_fatal() {
        let error = Error::NotFound("partner EmailAccounts/1".into());
        assert!(error.is_not_found());
        assert!(!error.is_fatal());
    }
}
