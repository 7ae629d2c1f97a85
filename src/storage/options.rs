use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::{Result, StorageError};

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 4096;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;

/// Out-of-band conditions the engine recovers from on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageNotification {
    /// The configured page size differs from the one persisted in the header;
    /// the persisted value is used.
    PageSizeMismatch {
        /// Page size requested by the options.
        configured: u32,
        /// Page size found on disk.
        persisted: u32,
    },
}

/// Callback receiving [`StorageNotification`]s.
pub type NotificationHook = Arc<dyn Fn(&StorageNotification) + Send + Sync>;

/// Configuration supplied when opening a
/// [`StorageEnvironment`](super::StorageEnvironment).
#[derive(Clone)]
pub struct StorageOptions {
    /// Directory holding the data file and header files.
    pub base_path: PathBuf,
    /// Directory holding journal files; defaults to `base_path`.
    pub journal_path: Option<PathBuf>,
    /// Page size used when creating a store.
    pub page_size: u32,
    /// Size after which the journal rolls to a new file.
    pub max_log_file_size: u64,
    /// Size a new journal file is preallocated to.
    pub initial_log_file_size: u64,
    /// When set, commits never flush the journal into the data file; callers
    /// flush explicitly.
    pub manual_flush: bool,
    /// Keep retired journals for incremental backup.
    pub incremental_backup_enabled: bool,
    /// Whether journal appends are fsynced before commit returns.
    pub sync_journal: bool,
    /// Capacity of the data-file page cache, in pages.
    pub cache_pages: usize,
    /// Receives recoverable configuration mismatches.
    pub notifications: Option<NotificationHook>,
}

impl fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageOptions")
            .field("base_path", &self.base_path)
            .field("journal_path", &self.journal_path)
            .field("page_size", &self.page_size)
            .field("max_log_file_size", &self.max_log_file_size)
            .field("initial_log_file_size", &self.initial_log_file_size)
            .field("manual_flush", &self.manual_flush)
            .field("incremental_backup_enabled", &self.incremental_backup_enabled)
            .field("sync_journal", &self.sync_journal)
            .field("cache_pages", &self.cache_pages)
            .field("notifications", &self.notifications.is_some())
            .finish()
    }
}

impl StorageOptions {
    /// Options for a store rooted at `base_path` with default settings.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            journal_path: None,
            page_size: MIN_PAGE_SIZE,
            max_log_file_size: 64 * 1024 * 1024,
            initial_log_file_size: 64 * 1024,
            manual_flush: false,
            incremental_backup_enabled: false,
            sync_journal: true,
            cache_pages: 1024,
            notifications: None,
        }
    }

    /// Stores journal files in `path` instead of the base directory.
    pub fn journal_path(mut self, path: impl AsRef<Path>) -> Self {
        self.journal_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the page size used for new stores.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the journal roll-over size.
    pub fn max_log_file_size(mut self, bytes: u64) -> Self {
        self.max_log_file_size = bytes;
        self
    }

    /// Sets the journal preallocation size.
    pub fn initial_log_file_size(mut self, bytes: u64) -> Self {
        self.initial_log_file_size = bytes;
        self
    }

    /// Disables flushing after every commit.
    pub fn manual_flush(mut self, manual: bool) -> Self {
        self.manual_flush = manual;
        self
    }

    /// Keeps retired journals for incremental backup.
    pub fn incremental_backup(mut self, enabled: bool) -> Self {
        self.incremental_backup_enabled = enabled;
        self
    }

    /// Controls fsync after journal appends.
    pub fn sync_journal(mut self, sync: bool) -> Self {
        self.sync_journal = sync;
        self
    }

    /// Installs a notification hook.
    pub fn notifications(mut self, hook: NotificationHook) -> Self {
        self.notifications = Some(hook);
        self
    }

    /// Directory journal files live in.
    pub fn journal_dir(&self) -> &Path {
        self.journal_path.as_deref().unwrap_or(&self.base_path)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(StorageError::Invalid(
                "page size must be a power of two between 4096 and 32768",
            ));
        }
        if self.max_log_file_size < u64::from(self.page_size) * 4 {
            return Err(StorageError::Invalid(
                "max log file size must hold at least four pages",
            ));
        }
        if self.initial_log_file_size == 0 || self.initial_log_file_size > self.max_log_file_size {
            return Err(StorageError::Invalid(
                "initial log file size must be between one byte and the max log file size",
            ));
        }
        Ok(())
    }
}
