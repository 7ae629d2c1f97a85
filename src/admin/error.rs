use std::path::{Path, PathBuf};

use crate::types::StorageError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No store found at the specified path.
    #[error("store not found: {0}")]
    MissingDatabase(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Storage engine error.
    #[error(transparent)]
    Core(#[from] StorageError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Backup archive could not be read or written.
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_database(path: impl AsRef<Path>) -> Self {
        AdminError::MissingDatabase(path.as_ref().to_path_buf())
    }
}
