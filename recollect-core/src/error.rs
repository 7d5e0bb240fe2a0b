//! Error types for recollect-core

use thiserror::Error;

/// Main error type for the recollect-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session source (transcript root or file) could not be read
    #[error("session source inaccessible: {0}")]
    SourceInaccessible(String),

    /// Transcript or export content failed to decode
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The store was busy or locked during a write
    #[error("database locked: {0}")]
    DbLocked(String),

    /// Store failure other than lock contention
    #[error("database connection failed: {0}")]
    DbConnectionFailed(String),

    /// The SQLite build lacks the FTS5 extension
    #[error("FTS5 extension unavailable: {0}")]
    Fts5Unavailable(String),

    /// Export document failed validation before import
    #[error("invalid export file: {0}")]
    InvalidExportFile(String),

    /// Domain invariant broken (programmer error, corrupt input)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Semantic category for per-session sync failures.
///
/// Raw errors from I/O, decoding, and the store are folded into one of these
/// when recorded on a sync result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    SourceInaccessible,
    InvalidJson,
    DbLocked,
    DbConnectionFailed,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::SourceInaccessible => "source_inaccessible",
            ErrorCategory::InvalidJson => "invalid_json",
            ErrorCategory::DbLocked => "db_locked",
            ErrorCategory::DbConnectionFailed => "db_connection_failed",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Error {
    /// Fold a raw error into its semantic sync category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(_) | Error::SourceInaccessible(_) => ErrorCategory::SourceInaccessible,
            Error::Json(_) | Error::InvalidJson(_) => ErrorCategory::InvalidJson,
            Error::DbLocked(_) => ErrorCategory::DbLocked,
            Error::Database(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorCategory::DbLocked
            }
            _ => ErrorCategory::DbConnectionFailed,
        }
    }
}

/// Result type alias for recollect-core
pub type Result<T> = std::result::Result<T, Error>;
