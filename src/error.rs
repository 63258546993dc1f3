//! Error taxonomy for the engine.
//!
//! The reader layer works in `anyhow` (lots of CLI plumbing and parsing);
//! everything crossing the public surface is converted to `EngineError` at the
//! job boundary. Cancellation is an expected outcome, not a user-visible error.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Archive unreadable or corrupt. Fatal for the session; retry requires
    /// reopening the archive.
    #[error("archive reader error: {0}")]
    Reader(String),

    /// Temp-file or index-store I/O failure, surfaced after one transparent retry.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Index store catalog failure.
    #[error("index store error")]
    Index(#[from] rusqlite::Error),

    /// Cooperative cancellation took effect. Expected, not surfaced to users.
    #[error("operation cancelled")]
    Cancelled,

    #[error("no open session for {}", .0.display())]
    SessionNotFound(PathBuf),

    #[error("page index {index} out of range ({count} entries)")]
    PageOutOfRange { index: usize, count: usize },
}

impl EngineError {
    /// Collapse an error chain from the reader layer into a `Reader` error.
    pub fn reader(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Reader(format!("{:#}", err.into()))
    }
}

/// Run an I/O operation, retrying once on failure before giving up.
pub(crate) fn retry_once<T, F>(mut op: F) -> std::io::Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    match op() {
        Ok(v) => Ok(v),
        Err(first) => {
            tracing::warn!("I/O operation failed, retrying once: {first}");
            op()
        }
    }
}
