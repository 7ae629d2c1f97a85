use std::path::{Path, PathBuf};

use crate::storage::StorageOptions;

/// Common options used when opening a store for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Page size used if the store has to be created.
    pub page_size: u32,
    /// Directory holding journal files, when separate from the data directory.
    pub journal_path: Option<PathBuf>,
    /// Size after which the journal rolls to a new file.
    pub max_log_file_size: u64,
    /// Whether journal appends are fsynced.
    pub sync_journal: bool,
    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        let defaults = StorageOptions::new("");
        Self {
            page_size: defaults.page_size,
            journal_path: None,
            max_log_file_size: defaults.max_log_file_size,
            sync_journal: defaults.sync_journal,
            create_if_missing: false,
        }
    }
}

impl AdminOpenOptions {
    /// Storage options for the store rooted at `path`.
    pub fn storage_options(&self, path: &Path) -> StorageOptions {
        let mut options = StorageOptions::new(path)
            .page_size(self.page_size)
            .max_log_file_size(self.max_log_file_size)
            .sync_journal(self.sync_journal);
        options.initial_log_file_size = options.initial_log_file_size.min(self.max_log_file_size);
        if let Some(journal) = &self.journal_path {
            options = options.journal_path(journal);
        }
        options
    }
}
