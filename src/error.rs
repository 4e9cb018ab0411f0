use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for WAL operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// Error type for WAL operations.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A decoded record did not match its declared layout. Unlike a corrupt
    /// tail (which is repaired in place), this indicates a file the WAL does
    /// not understand and aborts the operation that hit it.
    #[error("invariant violation in {path:?}: {details}")]
    InvariantViolation { details: String, path: PathBuf },

    #[error("file {0:?} has wrong name format to be a segment file")]
    SegmentName(PathBuf),

    #[error("lock acquisition failed: {0}")]
    Lock(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("WAL is closed")]
    Closed,
}

impl<T> From<std::sync::PoisonError<T>> for WalError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        WalError::Lock(format!("mutex/rwlock poisoned: {}", err))
    }
}
