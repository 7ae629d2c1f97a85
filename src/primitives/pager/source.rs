use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PageId, Result, StorageError, TxId};

const DEFAULT_CACHE_PAGES: usize = 1024;

/// Immutable image of a page as committed by some transaction.
pub type PageImage = Arc<[u8]>;

/// Page store over the data file plus the committed-but-unflushed page
/// versions that live only in the journal.
///
/// A read at snapshot `s` observes the newest version committed at or before
/// `s`, falling back to the data file. `flush` moves versions into the data
/// file; callers bound it by the oldest live snapshot so no reader ever loses
/// the version it needs.
pub struct PageSource {
    file: StdFileIo,
    page_size: usize,
    versions: RwLock<FxHashMap<u64, Vec<(TxId, PageImage)>>>,
    cache: Mutex<LruCache<u64, PageImage>>,
}

impl PageSource {
    /// Opens or creates the data file at `path`.
    pub fn open(path: impl AsRef<Path>, page_size: usize, cache_pages: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(StorageError::Invalid("page size must be non-zero"));
        }
        let capacity = NonZeroUsize::new(cache_pages)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_PAGES))
            .ok_or(StorageError::Invalid("page cache capacity must be non-zero"))?;
        Ok(Self {
            file: StdFileIo::open(path)?,
            page_size,
            versions: RwLock::new(FxHashMap::default()),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Handle to the underlying data file.
    pub fn file(&self) -> &StdFileIo {
        &self.file
    }

    /// Number of whole pages currently present in the data file.
    pub fn pages_in_file(&self) -> Result<u64> {
        Ok(self.file.len()? / self.page_size as u64)
    }

    /// Reads `page` as visible to a transaction with snapshot `snapshot`.
    pub fn read(&self, page: PageId, snapshot: TxId) -> Result<PageImage> {
        let versions = self.versions.read();
        if let Some(chain) = versions.get(&page.0) {
            if let Some((_, image)) = chain.iter().rev().find(|(tx, _)| *tx <= snapshot) {
                return Ok(Arc::clone(image));
            }
        }
        // The data file only changes under the versions write lock, so
        // loading while holding the read lock cannot observe a torn flush.
        if let Some(image) = self.cache.lock().get(&page.0) {
            return Ok(Arc::clone(image));
        }
        let mut buf = vec![0u8; self.page_size];
        self.file
            .read_at(page.0 * self.page_size as u64, &mut buf)
            .map_err(|err| match err {
                StorageError::Io(inner)
                    if inner.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    StorageError::Corruption("page beyond end of data file")
                }
                other => other,
            })?;
        let image: PageImage = Arc::from(buf.into_boxed_slice());
        self.cache.lock().put(page.0, Arc::clone(&image));
        Ok(image)
    }

    /// Installs the page images committed by transaction `tx`.
    pub fn publish(&self, tx: TxId, pages: Vec<(PageId, PageImage)>) {
        let mut versions = self.versions.write();
        for (page, image) in pages {
            versions.entry(page.0).or_default().push((tx, image));
        }
    }

    /// Number of pages holding at least one unflushed version.
    pub fn pending_pages(&self) -> usize {
        self.versions.read().len()
    }

    /// Writes every page's newest version at or before `up_to` into the data
    /// file, syncs it, and drops the versions that are now redundant.
    ///
    /// Returns the number of pages written.
    pub fn flush(&self, up_to: TxId) -> Result<usize> {
        let mut versions = self.versions.write();
        let mut written = 0usize;
        let mut pages: Vec<u64> = versions.keys().copied().collect();
        pages.sort_unstable();
        for page in &pages {
            let Some(chain) = versions.get(page) else {
                continue;
            };
            let Some((_, image)) = chain.iter().rev().find(|(tx, _)| *tx <= up_to) else {
                continue;
            };
            self.file.write_at(*page * self.page_size as u64, image)?;
            self.cache.lock().put(*page, Arc::clone(image));
            written += 1;
        }
        if written > 0 {
            self.file.sync_all()?;
        }
        versions.retain(|_, chain| {
            chain.retain(|(tx, _)| *tx > up_to);
            !chain.is_empty()
        });
        debug!(up_to = up_to.0, pages = written, "pager.flush.completed");
        Ok(written)
    }

    /// Resizes the data file to exactly `pages` pages.
    pub fn set_length(&self, pages: u64) -> Result<()> {
        let _versions = self.versions.write();
        self.file.truncate(pages * self.page_size as u64)?;
        self.file.sync_all()?;
        let mut cache = self.cache.lock();
        let stale: Vec<u64> = cache
            .iter()
            .filter(|(page, _)| **page >= pages)
            .map(|(page, _)| *page)
            .collect();
        for page in stale {
            cache.pop(&page);
        }
        Ok(())
    }
}
