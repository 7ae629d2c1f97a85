#![forbid(unsafe_code)]

//! Store administration and maintenance utilities.
//!
//! This module provides the offline operations run against a whole store:
//! full backups into a zip archive, restoring such an archive, and
//! compaction into a fresh, densely packed store.

mod backup;
mod compaction;
mod error;
mod options;
mod util;

/// Full backups and their restore.
///
/// A backup fences writers just long enough to capture a consistent point,
/// then streams the headers, the data file and the live journals.
pub use backup::{restore, BackupOptions, BackupReport, BackupStage, FullBackup, RestoreReport};

/// Store compaction.
///
/// Rewrites every live record into a new store and shrinks its data file.
pub use compaction::{
    compact, CompactionProgress, CompactionReport, ProgressCallback, StorageCompaction,
};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Configuration options for opening a store in admin mode.
pub use options::AdminOpenOptions;

/// Utility functions for opening stores.
pub use util::{open_store, store_exists};
