//! Page-level transactions.
//!
//! A [`LowLevelTransaction`] pins an MVCC snapshot of the page source and, for
//! writers, owns the store-wide write lock plus a private copy-on-write set of
//! dirty pages. Nothing a writer does is visible to anyone until
//! [`LowLevelTransaction::commit`] journals and publishes the dirty pages.

use std::collections::hash_map::Entry;
use std::ops::Deref;

use parking_lot::MutexGuard;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::primitives::pager::{PageImage, PageSource};
use crate::storage::env::{ReaderSnapshot, StorageEnvironment};
use crate::storage::tree::Tree;
use crate::types::{PageId, Result, StorageError, TxId, ROOT_TREE_NAME};

/// Kind of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionFlags {
    /// Snapshot reader.
    Read,
    /// The single writer.
    ReadWrite,
}

/// A page as seen by a transaction: either its own dirty copy or a shared
/// committed image.
pub enum PageRef<'a> {
    /// Page modified by the current transaction.
    Dirty(&'a [u8]),
    /// Page as committed at the transaction's snapshot.
    Committed(PageImage),
}

impl Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageRef::Dirty(buf) => buf,
            PageRef::Committed(image) => image,
        }
    }
}

/// Transaction-private view over the page source.
pub struct TxPages<'env> {
    source: &'env PageSource,
    snapshot: TxId,
    page_size: usize,
    writable: bool,
    dirty: FxHashMap<u64, Vec<u8>>,
    freed: Vec<PageId>,
    freed_set: FxHashSet<u64>,
    next_page: u64,
}

impl<'env> TxPages<'env> {
    pub(crate) fn new(
        source: &'env PageSource,
        snapshot: TxId,
        writable: bool,
        next_page: u64,
    ) -> Self {
        Self {
            source,
            snapshot,
            page_size: source.page_size(),
            writable,
            dirty: FxHashMap::default(),
            freed: Vec::new(),
            freed_set: FxHashSet::default(),
            next_page,
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether pages may be modified.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of pages allocated as seen by this transaction.
    pub fn allocated_pages(&self) -> u64 {
        self.next_page
    }

    /// Reads `page`.
    pub fn read(&self, page: PageId) -> Result<PageRef<'_>> {
        if self.freed_set.contains(&page.0) {
            return Err(StorageError::Invalid("page was freed by this transaction"));
        }
        if page.0 >= self.next_page {
            return Err(StorageError::Corruption("page beyond allocated range"));
        }
        if let Some(buf) = self.dirty.get(&page.0) {
            return Ok(PageRef::Dirty(buf));
        }
        Ok(PageRef::Committed(self.source.read(page, self.snapshot)?))
    }

    /// Returns a writable copy of `page`, copying the committed image on first
    /// write.
    pub fn modify(&mut self, page: PageId) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(StorageError::Invalid("read transactions cannot modify pages"));
        }
        if self.freed_set.contains(&page.0) {
            return Err(StorageError::Invalid("page was freed by this transaction"));
        }
        if page.0 >= self.next_page {
            return Err(StorageError::Corruption("page beyond allocated range"));
        }
        match self.dirty.entry(page.0) {
            Entry::Occupied(entry) => Ok(entry.into_mut().as_mut_slice()),
            Entry::Vacant(entry) => {
                let image = self.source.read(page, self.snapshot)?;
                Ok(entry.insert(image.to_vec()).as_mut_slice())
            }
        }
    }

    /// Allocates a zeroed page at the end of the file.
    pub fn allocate(&mut self) -> Result<PageId> {
        if !self.writable {
            return Err(StorageError::Invalid("read transactions cannot allocate pages"));
        }
        let page = PageId(self.next_page);
        self.next_page += 1;
        self.dirty.insert(page.0, vec![0u8; self.page_size]);
        Ok(page)
    }

    /// Releases `page`. Freed pages are reported to the free-space tree at
    /// commit and never handed out again by this transaction.
    pub fn free(&mut self, page: PageId) -> Result<()> {
        if !self.writable {
            return Err(StorageError::Invalid("read transactions cannot free pages"));
        }
        if page.0 >= self.next_page {
            return Err(StorageError::Corruption("freeing page beyond allocated range"));
        }
        self.dirty.remove(&page.0);
        if self.freed_set.insert(page.0) {
            self.freed.push(page);
        }
        Ok(())
    }

    /// Whether `page` was freed by this transaction.
    pub fn is_freed(&self, page: PageId) -> bool {
        self.freed_set.contains(&page.0)
    }

    pub(crate) fn take_freed(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.freed)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.freed_set.is_empty()
    }

    fn take_dirty(&mut self) -> Vec<(PageId, PageImage)> {
        let mut pages: Vec<(PageId, PageImage)> = self
            .dirty
            .drain()
            .map(|(page, buf)| (PageId(page), PageImage::from(buf)))
            .collect();
        pages.sort_unstable_by_key(|(page, _)| *page);
        pages
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LltState {
    Active,
    Committed,
    Disposed,
}

/// Page-level transaction over a [`StorageEnvironment`].
pub struct LowLevelTransaction<'env> {
    env: &'env StorageEnvironment,
    id: TxId,
    snapshot: TxId,
    flags: TransactionFlags,
    pages: TxPages<'env>,
    root: Tree,
    write_guard: Option<MutexGuard<'env, ()>>,
    registered: bool,
    state: LltState,
}

impl<'env> LowLevelTransaction<'env> {
    pub(crate) fn new(
        env: &'env StorageEnvironment,
        snapshot: ReaderSnapshot,
        write_guard: Option<MutexGuard<'env, ()>>,
    ) -> Self {
        let writable = write_guard.is_some();
        let (id, flags) = if writable {
            (snapshot.tx.next(), TransactionFlags::ReadWrite)
        } else {
            (snapshot.tx, TransactionFlags::Read)
        };
        debug!(tx = id.0, snapshot = snapshot.tx.0, writable, "storage.tx.begin");
        Self {
            env,
            id,
            snapshot: snapshot.tx,
            flags,
            pages: TxPages::new(env.pager(), snapshot.tx, writable, snapshot.next_page),
            root: Tree::open(ROOT_TREE_NAME, snapshot.root),
            write_guard,
            registered: true,
            state: LltState::Active,
        }
    }

    /// Transaction id; for readers this is the snapshot id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Last committed transaction visible to this one.
    pub fn snapshot(&self) -> TxId {
        self.snapshot
    }

    /// Read or read-write.
    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    /// Environment the transaction belongs to.
    pub fn env(&self) -> &'env StorageEnvironment {
        self.env
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            LltState::Active => Ok(()),
            LltState::Committed => Err(StorageError::Invalid("transaction already committed")),
            LltState::Disposed => Err(StorageError::Disposed("transaction")),
        }
    }

    /// Root-object tree (`$Root`).
    pub fn root_objects(&self) -> Result<&Tree> {
        self.ensure_active()?;
        Ok(&self.root)
    }

    /// Page view of the transaction.
    pub fn pages(&self) -> &TxPages<'env> {
        &self.pages
    }

    /// Mutable page view of the transaction.
    pub fn pages_mut(&mut self) -> &mut TxPages<'env> {
        &mut self.pages
    }

    /// Root-object tree and page view, borrowed together.
    pub fn root_and_pages(&mut self) -> (&mut Tree, &mut TxPages<'env>) {
        (&mut self.root, &mut self.pages)
    }

    /// Reads a page.
    pub fn get_page(&self, page: PageId) -> Result<PageRef<'_>> {
        self.ensure_active()?;
        self.pages.read(page)
    }

    /// Copy-on-write access to a page.
    pub fn modify_page(&mut self, page: PageId) -> Result<&mut [u8]> {
        self.ensure_active()?;
        self.pages.modify(page)
    }

    /// Allocates a new page.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        self.ensure_active()?;
        self.pages.allocate()
    }

    /// Frees a page.
    pub fn free_page(&mut self, page: PageId) -> Result<()> {
        self.ensure_active()?;
        self.pages.free(page)
    }

    /// Journals and publishes the transaction's pages, then releases the
    /// write lock. Unless the environment flushes manually, the journal is
    /// then applied to the data file.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.flags != TransactionFlags::ReadWrite {
            return Err(StorageError::Invalid("read transactions cannot commit"));
        }
        let has_changes = self.pages.is_dirty() || self.root.is_modified();
        if has_changes {
            let pages = self.pages.take_dirty();
            let last_page_number = self.pages.allocated_pages() as i64 - 1;
            self.env
                .commit_transaction(self.id, *self.root.header(), last_page_number, pages)?;
        }
        self.state = LltState::Committed;
        self.release();
        if has_changes && !self.env.options().manual_flush {
            self.env.flush_log_to_data_file()?;
        }
        Ok(())
    }

    /// Ends the transaction, discarding uncommitted changes.
    pub fn dispose(&mut self) {
        if self.state == LltState::Active {
            debug!(tx = self.id.0, "storage.tx.disposed");
        }
        self.state = LltState::Disposed;
        self.release();
    }

    /// Whether the transaction has been committed or disposed.
    pub fn is_finished(&self) -> bool {
        self.state != LltState::Active
    }

    fn release(&mut self) {
        if self.registered {
            self.env.unregister_reader(self.snapshot);
            self.registered = false;
        }
        self.write_guard = None;
    }
}

impl Drop for LowLevelTransaction<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
