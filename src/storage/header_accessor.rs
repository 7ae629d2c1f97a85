//! Crash-safe access to the redundant file header.
//!
//! Every `modify` writes the whole header to `HEADER_FILE_NAMES[revision & 1]`,
//! so consecutive writes alternate between the two files. A crash can only
//! tear the file being written; the other one still holds the previous
//! revision, and `initialize` picks the highest valid revision.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::header::{FileHeader, CURRENT_VERSION, FILE_HEADER_LEN, HEADER_FILE_NAMES};
use crate::storage::options::{NotificationHook, StorageNotification};
use crate::types::{Result, StorageError};

enum HeaderFile {
    Missing,
    Invalid,
    Valid(FileHeader),
}

struct HeaderState {
    header: FileHeader,
    disposed: bool,
}

/// Owner of the in-memory file header and its two on-disk copies.
pub struct HeaderAccessor {
    dir: PathBuf,
    configured_page_size: u32,
    notifications: Option<NotificationHook>,
    state: RwLock<HeaderState>,
}

impl HeaderAccessor {
    /// Creates an accessor for the header files in `dir`. Nothing is read
    /// until [`HeaderAccessor::initialize`].
    pub fn new(
        dir: impl AsRef<Path>,
        configured_page_size: u32,
        notifications: Option<NotificationHook>,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            configured_page_size,
            notifications,
            state: RwLock::new(HeaderState {
                header: FileHeader::fresh(configured_page_size),
                disposed: false,
            }),
        }
    }

    /// Loads the authoritative header. Returns `true` when no header existed
    /// and a new store was created.
    pub fn initialize(&self) -> Result<bool> {
        let mut state = self.state.write();
        if state.disposed {
            return Err(StorageError::Disposed("header accessor"));
        }
        let one = self.read_file(HEADER_FILE_NAMES[0])?;
        let two = self.read_file(HEADER_FILE_NAMES[1])?;
        let mut header = match (one, two) {
            (HeaderFile::Missing, HeaderFile::Missing) => {
                let header = FileHeader::fresh(self.configured_page_size);
                let encoded = header.encode()?;
                for name in HEADER_FILE_NAMES {
                    self.write_file(name, &encoded)?;
                }
                state.header = header;
                info!(
                    dir = %self.dir.display(),
                    page_size = self.configured_page_size,
                    "storage.header.created"
                );
                return Ok(true);
            }
            (HeaderFile::Valid(a), HeaderFile::Valid(b)) => {
                if b.header_revision > a.header_revision {
                    b
                } else {
                    a
                }
            }
            (HeaderFile::Valid(header), _) | (_, HeaderFile::Valid(header)) => {
                warn!(
                    dir = %self.dir.display(),
                    revision = header.header_revision,
                    "storage.header.recovered"
                );
                header
            }
            _ => return Err(StorageError::Corruption("no valid header file")),
        };
        if header.version != CURRENT_VERSION {
            return Err(StorageError::VersionMismatch {
                found: header.version,
                expected: CURRENT_VERSION,
            });
        }
        header.last_transaction()?;
        let persisted = u32::try_from(header.page_size)
            .map_err(|_| StorageError::Corruption("negative page size"))?;
        if persisted == 0 {
            return Err(StorageError::Corruption("zero page size"));
        }
        if persisted != self.configured_page_size {
            warn!(
                configured = self.configured_page_size,
                persisted, "storage.header.page_size_mismatch"
            );
            if let Some(hook) = &self.notifications {
                hook(&StorageNotification::PageSizeMismatch {
                    configured: self.configured_page_size,
                    persisted,
                });
            }
            header.page_size = persisted as i32;
        }
        state.header = header;
        Ok(false)
    }

    /// Projects a value out of the current header.
    pub fn get<T>(&self, projector: impl FnOnce(&FileHeader) -> T) -> Result<T> {
        let state = self.state.read();
        if state.disposed {
            return Err(StorageError::Disposed("header accessor"));
        }
        Ok(projector(&state.header))
    }

    /// Copy of the current header.
    pub fn header(&self) -> Result<FileHeader> {
        self.get(|header| *header)
    }

    /// Applies `mutator`, bumps the revision and persists the result to the
    /// file selected by the new revision. The in-memory header only changes
    /// once the write succeeded.
    pub fn modify(&self, mutator: impl FnOnce(&mut FileHeader)) -> Result<FileHeader> {
        let mut state = self.state.write();
        if state.disposed {
            return Err(StorageError::Disposed("header accessor"));
        }
        let mut next = state.header;
        mutator(&mut next);
        next.header_revision = state.header.header_revision + 1;
        let encoded = next.encode()?;
        self.write_file(Self::file_for_revision(next.header_revision), &encoded)?;
        state.header = next;
        Ok(next)
    }

    /// Name of the file a header with `revision` is written to.
    pub fn file_for_revision(revision: i64) -> &'static str {
        HEADER_FILE_NAMES[(revision & 1) as usize]
    }

    /// Raw bytes of both header files, read under the header lock so no
    /// `modify` interleaves.
    pub fn copy_header_files(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        let state = self.state.read();
        if state.disposed {
            return Err(StorageError::Disposed("header accessor"));
        }
        HEADER_FILE_NAMES
            .iter()
            .map(|name| Ok((*name, fs::read(self.dir.join(name))?)))
            .collect()
    }

    /// Releases the accessor; every later call fails with `Disposed`.
    pub fn dispose(&self) {
        self.state.write().disposed = true;
    }

    /// Directory holding the header files.
    pub fn dir(&self) -> Result<&Path> {
        if self.state.read().disposed {
            return Err(StorageError::Disposed("header accessor"));
        }
        Ok(&self.dir)
    }

    fn read_file(&self, name: &str) -> Result<HeaderFile> {
        let bytes = match fs::read(self.dir.join(name)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HeaderFile::Missing),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < FILE_HEADER_LEN {
            return Ok(HeaderFile::Missing);
        }
        match FileHeader::decode(&bytes) {
            Ok(header) if header.has_valid_marker() => Ok(HeaderFile::Valid(header)),
            _ => Ok(HeaderFile::Invalid),
        }
    }

    fn write_file(&self, name: &str, encoded: &[u8]) -> Result<()> {
        let io = StdFileIo::open(self.dir.join(name))?;
        io.write_at(0, encoded)?;
        io.truncate(encoded.len() as u64)?;
        io.sync_all()
    }
}
