#![forbid(unsafe_code)]
//! Variable-size B+tree over byte-string keys.
//!
//! Trees are plain values holding their root header; every operation takes
//! the transaction's page view explicitly. Pages split when they overflow and
//! are released once empty. Partially filled pages are never merged.

mod iter;
pub mod page;

use smallvec::SmallVec;

pub(crate) use iter::collect_keys;
pub use iter::TreeIterator;

use crate::storage::header::{tree_flags, TreeRootHeader};
use crate::storage::llt::TxPages;
use crate::types::{PageId, Result, StorageError};

use page::{BranchEntry, LeafEntry, NodeKind};

/// Flags stored with every leaf record.
pub mod record_flags {
    /// Plain value.
    pub const DATA: u8 = 0;
    /// Value is the root header of a nested multi-value tree.
    pub const MULTI_VALUE: u8 = 1;
    /// Value is an embedded fixed-size tree slot.
    pub const FIXED_SIZE_TREE: u8 = 2;
}

const MAX_DEPTH: usize = 64;

pub(crate) type TreePath = SmallVec<[(PageId, usize); 8]>;

/// A leaf record copied out of the tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeRecord {
    /// Record flags (see [`record_flags`]).
    pub flags: u8,
    /// Stored value.
    pub value: Vec<u8>,
}

/// In-memory handle of one variable-size tree.
#[derive(Clone, Debug)]
pub struct Tree {
    name: String,
    header: TreeRootHeader,
    modified: bool,
}

impl Tree {
    /// A tree with no pages yet, flagged as modified.
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header: TreeRootHeader::empty(),
            modified: true,
        }
    }

    /// A fresh nested tree holding the values of one multi-value key.
    pub fn create_nested(name: impl Into<String>) -> Self {
        let mut tree = Self::create(name);
        tree.header.flags = tree_flags::MULTI_VALUE;
        tree
    }

    /// Wraps a persisted root header.
    pub fn open(name: impl Into<String>, header: TreeRootHeader) -> Self {
        Self {
            name: name.into(),
            header,
            modified: false,
        }
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Current root header.
    pub fn header(&self) -> &TreeRootHeader {
        &self.header
    }

    /// Whether the root header changed since it was last persisted.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_clean(&mut self) {
        self.modified = false;
    }

    pub(crate) fn mark_modified(&mut self) {
        self.modified = true;
    }

    pub(crate) fn add_header_flags(&mut self, flags: u8) {
        if self.header.flags & flags != flags {
            self.header.flags |= flags;
            self.modified = true;
        }
    }

    /// Number of records in the tree.
    pub fn number_of_entries(&self) -> u64 {
        self.header.number_of_entries
    }

    /// Largest record, slot included, a page of `page_size` accepts.
    pub fn max_record_len(page_size: usize) -> usize {
        page_size / 4
    }

    /// Allocates the root leaf if the tree has none yet.
    pub fn ensure_root(&mut self, pages: &mut TxPages<'_>) -> Result<PageId> {
        if let Some(root) = self.header.root_page {
            return Ok(root);
        }
        let root = pages.allocate()?;
        page::write_leaf(pages.modify(root)?, root, &[])?;
        self.header.root_page = Some(root);
        self.header.leaf_pages = 1;
        self.header.page_count = 1;
        self.header.depth = 1;
        self.modified = true;
        Ok(root)
    }

    fn descend(&self, pages: &TxPages<'_>, root: PageId, key: &[u8]) -> Result<(TreePath, PageId)> {
        let mut path = TreePath::new();
        let mut current = root;
        loop {
            let buf = pages.read(current)?;
            match page::kind(&buf)? {
                NodeKind::Leaf => return Ok((path, current)),
                NodeKind::Branch => {
                    let idx = page::search_branch(&buf, key)?;
                    let child = page::branch_child(&buf, idx)?;
                    path.push((current, idx));
                    if path.len() > MAX_DEPTH {
                        return Err(StorageError::Corruption("tree deeper than supported"));
                    }
                    current = child;
                }
            }
        }
    }

    /// Inserts or replaces a plain value.
    pub fn add(&mut self, pages: &mut TxPages<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        self.add_record(pages, key, record_flags::DATA, value)
            .map(|_| ())
    }

    /// Inserts or replaces a record, returning the record it replaced.
    ///
    /// Nested structures owned by a replaced record are not released here.
    pub fn add_record(
        &mut self,
        pages: &mut TxPages<'_>,
        key: &[u8],
        flags: u8,
        value: &[u8],
    ) -> Result<Option<TreeRecord>> {
        if key.is_empty() {
            return Err(StorageError::Invalid("tree keys must not be empty"));
        }
        if page::leaf_record_len(key.len(), value.len()) > Self::max_record_len(pages.page_size()) {
            return Err(StorageError::Invalid("record exceeds a quarter page"));
        }
        let root = self.ensure_root(pages)?;
        let (path, leaf) = self.descend(pages, root, key)?;
        let mut entries = page::decode_leaf(&pages.read(leaf)?)?;
        let entry = LeafEntry {
            flags,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let previous = match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => {
                let old = std::mem::replace(&mut entries[pos], entry);
                Some(TreeRecord {
                    flags: old.flags,
                    value: old.value,
                })
            }
            Err(pos) => {
                entries.insert(pos, entry);
                self.header.number_of_entries += 1;
                None
            }
        };
        self.write_leaf_entries(pages, path, leaf, entries)?;
        self.modified = true;
        Ok(previous)
    }

    fn write_leaf_entries(
        &mut self,
        pages: &mut TxPages<'_>,
        path: TreePath,
        leaf: PageId,
        mut entries: Vec<LeafEntry>,
    ) -> Result<()> {
        if page::leaf_fits(pages.page_size(), &entries) {
            return page::write_leaf(pages.modify(leaf)?, leaf, &entries);
        }
        let at = page::split_point(&entries, page::leaf_entry_len);
        let right = entries.split_off(at);
        let sibling = pages.allocate()?;
        self.header.leaf_pages += 1;
        self.header.page_count += 1;
        page::write_leaf(pages.modify(leaf)?, leaf, &entries)?;
        page::write_leaf(pages.modify(sibling)?, sibling, &right)?;
        let separator = right[0].key.clone();
        self.insert_separator(pages, path, leaf, separator, sibling)
    }

    fn insert_separator(
        &mut self,
        pages: &mut TxPages<'_>,
        mut path: TreePath,
        left: PageId,
        separator: Vec<u8>,
        right: PageId,
    ) -> Result<()> {
        let Some((parent, idx)) = path.pop() else {
            let root = pages.allocate()?;
            let entries = [
                BranchEntry {
                    key: Vec::new(),
                    child: left,
                },
                BranchEntry {
                    key: separator,
                    child: right,
                },
            ];
            page::write_branch(pages.modify(root)?, root, &entries)?;
            self.header.branch_pages += 1;
            self.header.page_count += 1;
            self.header.root_page = Some(root);
            self.header.depth += 1;
            return Ok(());
        };
        let mut entries = page::decode_branch(&pages.read(parent)?)?;
        entries.insert(
            idx + 1,
            BranchEntry {
                key: separator,
                child: right,
            },
        );
        if page::branch_fits(pages.page_size(), &entries) {
            return page::write_branch(pages.modify(parent)?, parent, &entries);
        }
        let at = page::split_point(&entries, page::branch_entry_len);
        let upper = entries.split_off(at);
        let sibling = pages.allocate()?;
        self.header.branch_pages += 1;
        self.header.page_count += 1;
        let promoted = upper[0].key.clone();
        page::write_branch(pages.modify(parent)?, parent, &entries)?;
        page::write_branch(pages.modify(sibling)?, sibling, &upper)?;
        self.insert_separator(pages, path, parent, promoted, sibling)
    }

    /// Removes `key`, returning the removed record.
    pub fn delete(&mut self, pages: &mut TxPages<'_>, key: &[u8]) -> Result<Option<TreeRecord>> {
        let Some(root) = self.header.root_page else {
            return Ok(None);
        };
        let (path, leaf) = self.descend(pages, root, key)?;
        let mut entries = page::decode_leaf(&pages.read(leaf)?)?;
        let Ok(pos) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
            return Ok(None);
        };
        let removed = entries.remove(pos);
        self.header.number_of_entries -= 1;
        self.modified = true;
        if entries.is_empty() && !path.is_empty() {
            pages.free(leaf)?;
            self.header.leaf_pages -= 1;
            self.header.page_count -= 1;
            self.remove_child(pages, path)?;
        } else {
            page::write_leaf(pages.modify(leaf)?, leaf, &entries)?;
        }
        Ok(Some(TreeRecord {
            flags: removed.flags,
            value: removed.value,
        }))
    }

    fn remove_child(&mut self, pages: &mut TxPages<'_>, mut path: TreePath) -> Result<()> {
        while let Some((parent, idx)) = path.pop() {
            let mut entries = page::decode_branch(&pages.read(parent)?)?;
            entries.remove(idx);
            if entries.is_empty() {
                if path.is_empty() {
                    page::write_leaf(pages.modify(parent)?, parent, &[])?;
                    self.header.branch_pages -= 1;
                    self.header.leaf_pages += 1;
                    self.header.depth = 1;
                    return Ok(());
                }
                pages.free(parent)?;
                self.header.branch_pages -= 1;
                self.header.page_count -= 1;
                continue;
            }
            page::write_branch(pages.modify(parent)?, parent, &entries)?;
            break;
        }
        self.collapse_root(pages)
    }

    fn collapse_root(&mut self, pages: &mut TxPages<'_>) -> Result<()> {
        while let Some(root) = self.header.root_page {
            let child = {
                let buf = pages.read(root)?;
                if page::kind(&buf)? != NodeKind::Branch || page::entry_count(&buf)? != 1 {
                    break;
                }
                page::branch_child(&buf, 0)?
            };
            pages.free(root)?;
            self.header.branch_pages -= 1;
            self.header.page_count -= 1;
            self.header.root_page = Some(child);
            self.header.depth -= 1;
        }
        Ok(())
    }

    /// Reads a plain value.
    pub fn read(&self, pages: &TxPages<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.read_record(pages, key)? {
            None => Ok(None),
            Some(record) if record.flags == record_flags::DATA => Ok(Some(record.value)),
            Some(_) => Err(StorageError::Invalid("key holds a nested structure")),
        }
    }

    /// Reads a record of any kind.
    pub fn read_record(&self, pages: &TxPages<'_>, key: &[u8]) -> Result<Option<TreeRecord>> {
        let Some(root) = self.header.root_page else {
            return Ok(None);
        };
        let (_, leaf) = self.descend(pages, root, key)?;
        let buf = pages.read(leaf)?;
        match page::search_leaf(&buf, key)? {
            (pos, true) => {
                let record = page::leaf_record(&buf, pos)?;
                Ok(Some(TreeRecord {
                    flags: record.flags,
                    value: record.value.to_vec(),
                }))
            }
            _ => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn contains(&self, pages: &TxPages<'_>, key: &[u8]) -> Result<bool> {
        Ok(self.read_record(pages, key)?.is_some())
    }

    /// Cursor over the tree's records.
    pub fn iter<'a>(&self, pages: &'a TxPages<'a>) -> TreeIterator<'a> {
        TreeIterator::new(pages, self.header.root_page)
    }

    /// Every page owned by the tree itself, nested structures excluded.
    pub fn collect_pages(&self, pages: &TxPages<'_>) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        let mut stack: Vec<PageId> = self.header.root_page.into_iter().collect();
        while let Some(page_id) = stack.pop() {
            out.push(page_id);
            let buf = pages.read(page_id)?;
            if page::kind(&buf)? == NodeKind::Branch {
                for idx in 0..page::entry_count(&buf)? {
                    stack.push(page::branch_child(&buf, idx)?);
                }
            }
        }
        Ok(out)
    }

    /// Releases every page of the tree and of the nested structures its
    /// records own, leaving an empty tree.
    pub fn free_all(&mut self, pages: &mut TxPages<'_>) -> Result<()> {
        for page_id in self.collect_pages(pages)? {
            let nested: Vec<(u8, Vec<u8>)> = {
                let buf = pages.read(page_id)?;
                if page::kind(&buf)? == NodeKind::Leaf {
                    (0..page::entry_count(&buf)?)
                        .map(|idx| page::leaf_record(&buf, idx))
                        .filter_map(|record| match record {
                            Ok(r) if r.flags != record_flags::DATA => {
                                Some(Ok((r.flags, r.value.to_vec())))
                            }
                            Ok(_) => None,
                            Err(err) => Some(Err(err)),
                        })
                        .collect::<Result<_>>()?
                } else {
                    Vec::new()
                }
            };
            for (flags, value) in nested {
                free_payload(pages, flags, &value)?;
            }
            pages.free(page_id)?;
        }
        let flags = self.header.flags;
        self.header = TreeRootHeader::empty();
        self.header.flags = flags;
        self.modified = true;
        Ok(())
    }
}

/// Releases the pages owned by the nested structure stored in a record.
pub(crate) fn free_payload(pages: &mut TxPages<'_>, flags: u8, value: &[u8]) -> Result<()> {
    match flags {
        record_flags::MULTI_VALUE => {
            let header = TreeRootHeader::decode(value)?;
            Tree::open("", header).free_all(pages)
        }
        record_flags::FIXED_SIZE_TREE => crate::storage::fixed::free_slot_pages(pages, value),
        _ => Ok(()),
    }
}
