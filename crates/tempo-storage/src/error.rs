//! Error type for the persistence boundary.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Disk full, permission denied, corrupt file and every other SQLite failure.
    #[error("store I/O error: {0}")]
    Io(#[source] rusqlite::Error),

    #[error("store file error: {0}")]
    File(#[from] std::io::Error),

    /// Lock wait exceeded the configured timeout. Safe to retry.
    #[error("store busy: lock wait timed out")]
    Busy,

    /// Another process already holds the writer lock on this store.
    #[error("store {} is already open for writing by another process", .0.display())]
    Locked(PathBuf),

    /// The data file was written by a newer engine.
    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaMismatch { found: i64, supported: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether the operation may succeed if attempted again.
    ///
    /// Lock timeouts and operating-system I/O failures qualify; constraint
    /// violations and other deterministic SQLite errors do not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy => true,
            Self::Io(err) => matches!(
                err.sqlite_error_code(),
                Some(ErrorCode::SystemIoFailure | ErrorCode::DiskFull)
            ),
            _ => false,
        }
    }

    /// Whether the error means writes cannot proceed at all.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. } | Self::File(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::Busy
            }
            _ => Self::Io(err),
        }
    }
}
