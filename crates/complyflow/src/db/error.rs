//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A conditional insert hit an existing key.
    #[error("Duplicate {entity} key '{key}'")]
    Duplicate { entity: &'static str, key: String },

    /// A conditional update found the row in an unexpected state.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded.
    #[error("Corrupt {entity} row '{key}': {reason}")]
    Corrupt {
        entity: &'static str,
        key: String,
        reason: String,
    },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl DatabaseError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            DatabaseError::Io { .. } => true,
            _ => false,
        }
    }

    /// Whether the error is a primary/unique key collision.
    pub fn is_duplicate(&self) -> bool {
        match self {
            DatabaseError::Duplicate { .. } => true,
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> DatabaseError {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn test_busy_is_transient() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_transient());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_transient());
    }

    #[test]
    fn test_constraint_is_duplicate_not_transient() {
        let err = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT);
        assert!(err.is_duplicate());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_is_permanent() {
        assert!(!DatabaseError::Conflict("x".to_string()).is_transient());
    }
}
