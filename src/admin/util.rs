use std::fs;
use std::path::Path;

use crate::storage::{StorageEnvironment, HEADER_FILE_NAMES};

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the store rooted at `path`.
///
/// # Errors
///
/// Returns an error if the directory holds no header files and
/// `create_if_missing` is false, or if opening the environment fails.
pub fn open_store(path: &Path, opts: &AdminOpenOptions) -> Result<StorageEnvironment> {
    if !opts.create_if_missing && !store_exists(path) {
        return Err(AdminError::missing_database(path));
    }
    if opts.create_if_missing {
        fs::create_dir_all(path)?;
    }
    Ok(StorageEnvironment::open(opts.storage_options(path))?)
}

/// Whether `path` holds at least one header file.
pub fn store_exists(path: &Path) -> bool {
    HEADER_FILE_NAMES
        .iter()
        .any(|name| path.join(name).is_file())
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
