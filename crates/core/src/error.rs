//! Unified error types for sqlstash.
//!
//! Errors are grouped by how the cache reacts to them: storage exhaustion and
//! lock contention are recovered locally (see [`crate::cache::retry`]), everything
//! else is fatal and propagated to the caller.

use crate::config::ConfigError;
use tokio_rusqlite::rusqlite::{self, ErrorCode};

/// Unified error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration failed to load or validate.
    #[error("CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),

    /// Caller supplied an unusable argument.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Database operation failed.
    #[error("STORE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// The store reached its size ceiling and recovery did not free enough room.
    #[error("STORAGE_FULL: {0}")]
    StorageFull(String),

    /// A write lock could not be obtained within the retry budget.
    #[error("STORE_BUSY: gave up after {attempts} attempts")]
    Busy { attempts: u32 },

    /// No store handle became free within the configured timeout; nothing was applied.
    #[error("TIMEOUT: no store handle free within {0:?}")]
    Timeout(std::time::Duration),

    /// The cache has been closed.
    #[error("CLOSED: cache is closed")]
    Closed,

    /// Increment or decrement applied to a payload that is not an integer.
    #[error("NOT_NUMERIC: value for key {0:?} is not an integer")]
    NotNumeric(String),
}

/// How the cache should react to a failed storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The store refuses writes because its size ceiling is reached.
    Exhausted,
    /// A write lock could not be taken right now.
    Contended,
    /// Anything else.
    Fatal,
}

impl Error {
    /// Classify this error for the retry policy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Database(tokio_rusqlite::Error::Error(err)) => classify_sqlite(err),
            Error::StorageFull(_) => FailureKind::Exhausted,
            _ => FailureKind::Fatal,
        }
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> FailureKind {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DiskFull => FailureKind::Exhausted,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => FailureKind::Contended,
            _ => FailureKind::Fatal,
        },
        _ => FailureKind::Fatal,
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Closed,
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Closed,
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => Error::Closed,
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}
