#![forbid(unsafe_code)]
//! Identifiers, error types, and shared constants used across the engine.

use std::fmt;

pub mod checksum;

pub use checksum::{record_crc32, RecordChecksum};

/// Page number inside the data file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Monotonically increasing identifier of a committed write transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl TxId {
    /// Returns the identifier following this one.
    pub fn next(self) -> TxId {
        TxId(self.0 + 1)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The persisted format version differs from the compiled one.
    #[error("format version mismatch: file has {found}, engine expects {expected}")]
    VersionMismatch {
        /// Version read from disk.
        found: i32,
        /// Version compiled into the engine.
        expected: i32,
    },
    /// Caller supplied an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A cursor was read before it was positioned on an entry.
    #[error("invalid position: {0}")]
    InvalidPosition(&'static str),
    /// The object was used after being disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),
    /// A one-shot operation was executed a second time.
    #[error("{0} was already executed")]
    AlreadyExecuted(&'static str),
    /// Compaction was requested on a store that keeps incremental backups.
    #[error("compaction is not allowed while incremental backup is enabled")]
    IncrementalBackupConflict,
    /// A named object does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// A tree with the requested name already exists.
    #[error("tree {0} already exists")]
    TreeExists(String),
}

/// Result alias used by the engine.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Name of the root-object tree.
pub const ROOT_TREE_NAME: &str = "$Root";

/// Name of the fixed-size tree tracking freed pages.
pub const FREE_SPACE_TREE_NAME: &str = "$free-space";

/// Name of the data file inside the base directory.
pub const DATA_FILE_NAME: &str = "Raven.voron";

/// Extension used by journal files.
pub const JOURNAL_EXTENSION: &str = "journal";

/// Builds the file name of journal `number`.
pub fn journal_name(number: u64) -> String {
    format!("{number:019}.{JOURNAL_EXTENSION}")
}

/// Kind of object stored in a root-object slot.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize)]
pub enum RootObjectType {
    /// No object.
    None = 0,
    /// Variable-size tree described by a tree root header.
    VariableSizeTree = 1,
    /// Fixed-size tree stored inside another tree's value.
    EmbeddedFixedSizeTree = 2,
    /// Fixed-size tree registered directly in the root-object tree.
    FixedSizeTree = 3,
}

impl RootObjectType {
    /// Decodes a root object type tag.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::VariableSizeTree),
            2 => Ok(Self::EmbeddedFixedSizeTree),
            3 => Ok(Self::FixedSizeTree),
            _ => Err(StorageError::Corruption("unknown root object type")),
        }
    }
}
