//! Error types shared by the catalog and the capability layer.

use std::time::Duration;

use rusqlite::ErrorCode;
use rusqlite::ffi;
use thiserror::Error;

/// Failure conditions reported by [`crate::catalog::CatalogStore`].
///
/// Lookup misses are not errors; they come back as `Ok(None)`.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A video with the same URL is already registered.
    #[error("url already registered: {0}")]
    Conflict(String),

    /// The subtitle references a video that does not exist.
    #[error("video {0} does not exist")]
    MissingVideo(i64),

    /// The writer connection stayed busy for longer than the lock timeout.
    #[error("catalog is busy (waited {0:?} for the writer)")]
    LockTimeout(Duration),

    /// The caller cancelled the operation or its deadline passed.
    #[error("request aborted/timeout")]
    Cancelled,

    /// The blocking worker running the query panicked or was torn down.
    #[error("catalog worker failed: {0}")]
    Worker(String),

    /// Any other SQLite failure (I/O, corruption, lock contention).
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

impl CatalogError {
    /// Classifies a raw SQLite error, lifting constraint violations and
    /// interrupts into their dedicated variants.
    pub(crate) fn from_sqlite(err: rusqlite::Error, url: Option<&str>, video_id: Option<i64>) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            match code.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    if let Some(url) = url {
                        return Self::Conflict(url.to_owned());
                    }
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    if let Some(video_id) = video_id {
                        return Self::MissingVideo(video_id);
                    }
                }
                _ => {}
            }
            if code.code == ErrorCode::OperationInterrupted {
                return Self::Cancelled;
            }
        }
        Self::Unavailable(err)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors surfaced by the transport-agnostic operations in [`crate::service`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The caller supplied something unusable (empty title, bad URL, bad id).
    #[error("{0}")]
    InvalidInput(String),

    #[error("no such video")]
    NotFound,

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
