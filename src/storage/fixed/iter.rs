use std::io;

use crate::storage::fixed::page::FixedPageHeader;
use crate::storage::fixed::slot::{self, FixedSlot, SlotShape};
use crate::storage::fixed::FixedTree;
use crate::storage::llt::{PageRef, TxPages};
use crate::storage::tree::TreePath;
use crate::types::{PageId, Result, RootObjectType, StorageError};

/// Reader over the value under a cursor.
pub type ValueReader = io::Cursor<Vec<u8>>;

/// Cursor over a fixed-size tree.
///
/// The representation is picked once when the cursor is created; paged trees
/// are walked with an explicit stack of branch positions instead of sibling
/// links.
pub struct FixedSizeTreeIterator<'h, 't, 'env> {
    tree: &'h mut FixedTree<'t, 'env>,
    cursor: Cursor,
}

enum Cursor {
    Null,
    Embedded(EmbeddedCursor),
    Large(LargeCursor),
}

struct EmbeddedCursor {
    data: Vec<u8>,
    value_size: u16,
    pos: Option<usize>,
}

struct LargeCursor {
    root: PageId,
    stack: TreePath,
    leaf: Option<(PageId, usize)>,
}

impl Cursor {
    fn from_slot(slot: FixedSlot) -> Self {
        match slot.shape {
            SlotShape::Empty => Cursor::Null,
            SlotShape::Embedded(data) => Cursor::Embedded(EmbeddedCursor {
                data,
                value_size: slot.value_size,
                pos: None,
            }),
            SlotShape::Large(root) => Cursor::Large(LargeCursor {
                root: root.root,
                stack: TreePath::new(),
                leaf: None,
            }),
        }
    }
}

impl EmbeddedCursor {
    fn count(&self) -> usize {
        self.data.len() / slot::entry_len(self.value_size)
    }

    fn seek(&mut self, key: i64) -> Result<bool> {
        let (pos, _) = slot::search(&self.data, self.value_size, key)?;
        self.pos = (pos < self.count()).then_some(pos);
        Ok(self.pos.is_some())
    }

    fn seek_to_last(&mut self) -> bool {
        self.pos = self.count().checked_sub(1);
        self.pos.is_some()
    }

    fn skip(&mut self, count: i64) -> bool {
        self.pos = self
            .pos
            .and_then(|pos| pos.checked_add_signed(count as isize))
            .filter(|pos| *pos < self.count());
        self.pos.is_some()
    }

    fn current(&self) -> Result<usize> {
        self.pos
            .filter(|pos| *pos < self.count())
            .ok_or(StorageError::InvalidPosition("fixed-size tree cursor is not positioned"))
    }
}

impl LargeCursor {
    fn seek(&mut self, pages: &TxPages<'_>, key: i64) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        let mut current = self.root;
        loop {
            let buf = pages.read(current)?;
            let header = FixedPageHeader::read(&buf)?;
            if header.is_leaf() {
                let (pos, _) = header.search(&buf, key)?;
                self.leaf = Some((current, pos));
                if pos < header.entries as usize {
                    return Ok(true);
                }
                return self.climb(pages, true);
            }
            let idx = header.route(&buf, key)?;
            self.stack.push((current, idx));
            current = header.child(&buf, idx)?;
        }
    }

    fn seek_to_last(&mut self, pages: &TxPages<'_>) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        self.descend(pages, self.root, false)
    }

    /// Walks down to the first (`forward`) or last entry under `page`.
    fn descend(&mut self, pages: &TxPages<'_>, mut page: PageId, forward: bool) -> Result<bool> {
        loop {
            let buf = pages.read(page)?;
            let header = FixedPageHeader::read(&buf)?;
            let count = header.entries as usize;
            if header.is_leaf() {
                if count == 0 {
                    self.leaf = None;
                    return Ok(false);
                }
                self.leaf = Some((page, if forward { 0 } else { count - 1 }));
                return Ok(true);
            }
            let idx = if forward {
                0
            } else {
                count
                    .checked_sub(1)
                    .ok_or(StorageError::Corruption("empty fixed-size branch page"))?
            };
            self.stack.push((page, idx));
            page = header.child(&buf, idx)?;
        }
    }

    /// Pops ancestors until one has a neighbouring child, then descends into
    /// it.
    fn climb(&mut self, pages: &TxPages<'_>, forward: bool) -> Result<bool> {
        while let Some((branch, idx)) = self.stack.pop() {
            if pages.is_freed(branch) {
                break;
            }
            let buf = pages.read(branch)?;
            let header = FixedPageHeader::read(&buf)?;
            let next = if forward {
                Some(idx + 1).filter(|next| *next < header.entries as usize)
            } else {
                idx.checked_sub(1)
            };
            if let Some(next) = next {
                self.stack.push((branch, next));
                let child = header.child(&buf, next)?;
                return self.descend(pages, child, forward);
            }
        }
        self.stack.clear();
        self.leaf = None;
        Ok(false)
    }

    fn move_next(&mut self, pages: &TxPages<'_>) -> Result<bool> {
        let Some((leaf, idx)) = self.leaf else {
            return Ok(false);
        };
        if !pages.is_freed(leaf) {
            let buf = pages.read(leaf)?;
            if idx + 1 < FixedPageHeader::read(&buf)?.entries as usize {
                self.leaf = Some((leaf, idx + 1));
                return Ok(true);
            }
        }
        self.climb(pages, true)
    }

    fn move_prev(&mut self, pages: &TxPages<'_>) -> Result<bool> {
        let Some((leaf, idx)) = self.leaf else {
            return Ok(false);
        };
        if idx > 0 && !pages.is_freed(leaf) {
            self.leaf = Some((leaf, idx - 1));
            return Ok(true);
        }
        self.climb(pages, false)
    }

    fn skip(&mut self, pages: &TxPages<'_>, count: i64) -> Result<bool> {
        let forward = count > 0;
        let mut remaining = count.unsigned_abs();
        while remaining > 0 {
            let Some((leaf, idx)) = self.leaf else {
                return Ok(false);
            };
            let entries = if pages.is_freed(leaf) {
                0
            } else {
                let buf = pages.read(leaf)?;
                FixedPageHeader::read(&buf)?.entries as u64
            };
            let room = if forward {
                entries.saturating_sub(idx as u64 + 1)
            } else {
                idx as u64
            };
            if room >= remaining {
                let idx = if forward {
                    idx + remaining as usize
                } else {
                    idx - remaining as usize
                };
                self.leaf = Some((leaf, idx));
                return Ok(true);
            }
            remaining -= room + 1;
            if !self.climb(pages, forward)? {
                return Ok(false);
            }
        }
        Ok(self.leaf.is_some())
    }

    /// Puts the cursor back on the first entry after `deleted` when the
    /// delete released a page on its path or left it past the end of its
    /// leaf. Otherwise the entries shifted left and the position already
    /// holds the successor.
    fn reposition_after(&mut self, pages: &TxPages<'_>, deleted: i64) -> Result<()> {
        let stale = match self.leaf {
            Some((leaf, idx)) => {
                pages.is_freed(leaf)
                    || self.stack.iter().any(|(branch, _)| pages.is_freed(*branch))
                    || idx >= FixedPageHeader::read(&pages.read(leaf)?)?.entries as usize
            }
            None => true,
        };
        if stale {
            self.seek(pages, deleted)?;
        }
        Ok(())
    }

    fn current<'p>(&self, pages: &'p TxPages<'_>) -> Result<(PageRef<'p>, FixedPageHeader, usize)> {
        let Some((leaf, idx)) = self.leaf else {
            return Err(StorageError::InvalidPosition(
                "fixed-size tree cursor is not positioned",
            ));
        };
        if pages.is_freed(leaf) {
            return Err(StorageError::InvalidPosition(
                "fixed-size tree cursor points at a released page",
            ));
        }
        let buf = pages.read(leaf)?;
        let header = FixedPageHeader::read(&buf)?;
        if !header.is_leaf() || idx >= header.entries as usize {
            return Err(StorageError::InvalidPosition(
                "fixed-size tree cursor is past the end of its page",
            ));
        }
        Ok((buf, header, idx))
    }
}

impl<'h, 't, 'env> FixedSizeTreeIterator<'h, 't, 'env> {
    pub(crate) fn new(tree: &'h mut FixedTree<'t, 'env>) -> Result<Self> {
        let cursor = Cursor::from_slot(tree.load()?);
        Ok(Self { tree, cursor })
    }

    /// Positions on the first entry `>= key`.
    pub fn seek(&mut self, key: i64) -> Result<bool> {
        match &mut self.cursor {
            Cursor::Null => Ok(false),
            Cursor::Embedded(cursor) => cursor.seek(key),
            Cursor::Large(cursor) => cursor.seek(self.tree.pages()?, key),
        }
    }

    /// Positions on the last entry.
    pub fn seek_to_last(&mut self) -> Result<bool> {
        match &mut self.cursor {
            Cursor::Null => Ok(false),
            Cursor::Embedded(cursor) => Ok(cursor.seek_to_last()),
            Cursor::Large(cursor) => cursor.seek_to_last(self.tree.pages()?),
        }
    }

    /// Advances one entry; `false` once the end is passed.
    pub fn move_next(&mut self) -> Result<bool> {
        match &mut self.cursor {
            Cursor::Null => Ok(false),
            Cursor::Embedded(cursor) => Ok(cursor.skip(1)),
            Cursor::Large(cursor) => cursor.move_next(self.tree.pages()?),
        }
    }

    /// Steps back one entry; `false` once the start is passed.
    pub fn move_prev(&mut self) -> Result<bool> {
        match &mut self.cursor {
            Cursor::Null => Ok(false),
            Cursor::Embedded(cursor) => Ok(cursor.skip(-1)),
            Cursor::Large(cursor) => cursor.move_prev(self.tree.pages()?),
        }
    }

    /// Moves `count` entries forward (or backward when negative) without
    /// reading the entries in between. Returns whether the cursor still sits
    /// on an entry.
    pub fn skip(&mut self, count: i64) -> Result<bool> {
        if count == 0 {
            return Ok(self.current_key().is_ok());
        }
        match &mut self.cursor {
            Cursor::Null => Ok(false),
            Cursor::Embedded(cursor) => Ok(cursor.skip(count)),
            Cursor::Large(cursor) => cursor.skip(self.tree.pages()?, count),
        }
    }

    /// Key under the cursor.
    pub fn current_key(&self) -> Result<i64> {
        match &self.cursor {
            Cursor::Null => Err(StorageError::InvalidPosition("fixed-size tree is empty")),
            Cursor::Embedded(cursor) => slot::key_at(&cursor.data, cursor.value_size, cursor.current()?),
            Cursor::Large(cursor) => {
                let (buf, header, idx) = cursor.current(self.tree.pages()?)?;
                header.key(&buf, idx)
            }
        }
    }

    /// Value under the cursor.
    pub fn value(&self) -> Result<Vec<u8>> {
        match &self.cursor {
            Cursor::Null => Err(StorageError::InvalidPosition("fixed-size tree is empty")),
            Cursor::Embedded(cursor) => {
                Ok(slot::value_at(&cursor.data, cursor.value_size, cursor.current()?)?.to_vec())
            }
            Cursor::Large(cursor) => {
                let (buf, header, idx) = cursor.current(self.tree.pages()?)?;
                Ok(header.value(&buf, idx)?.to_vec())
            }
        }
    }

    /// Reader over the value under the cursor.
    pub fn create_reader_for_current(&self) -> Result<ValueReader> {
        Ok(io::Cursor::new(self.value()?))
    }

    /// Deletes the entry under the cursor and moves to the entry after it.
    ///
    /// Embedded trees and trees registered in the root-object tree re-seek
    /// to the next key and report whether one exists. A paged tree stored
    /// under another tree's key always reports `true`; when no entry follows
    /// the deleted one, the next read fails with `InvalidPosition`.
    pub fn delete_current_and_move_next(&mut self) -> Result<bool> {
        let key = self.current_key()?;
        self.tree.delete(key)?;
        let slot = self.tree.load()?;
        if self.tree.owner_type() != RootObjectType::FixedSizeTree {
            if let (Cursor::Large(cursor), SlotShape::Large(root)) = (&mut self.cursor, &slot.shape) {
                cursor.root = root.root;
                cursor.reposition_after(self.tree.pages()?, key)?;
                return Ok(true);
            }
        }
        self.cursor = Cursor::from_slot(slot);
        self.seek(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixed::FixedTreeShape;
    use crate::storage::{StorageEnvironment, StorageOptions};
    use std::io::Read;

    fn env() -> (tempfile::TempDir, StorageEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        let env = StorageEnvironment::open(
            StorageOptions::new(dir.path()).sync_journal(false).manual_flush(true),
        )
        .unwrap();
        (dir, env)
    }

    #[test]
    fn seek_on_small_tree() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("small", 0).unwrap();
        for key in [1, 3, 5] {
            tree.add(key, &[]).unwrap();
        }
        assert_eq!(tree.shape().unwrap(), FixedTreeShape::Embedded);
        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(3).unwrap());
        assert_eq!(iter.current_key().unwrap(), 3);
        assert!(iter.seek(4).unwrap());
        assert_eq!(iter.current_key().unwrap(), 5);
        assert!(!iter.seek(6).unwrap());
        assert!(matches!(
            iter.current_key(),
            Err(StorageError::InvalidPosition(_))
        ));
    }

    #[test]
    fn unpositioned_cursor_refuses_reads() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("t", 8).unwrap();
        tree.add(1, &[1; 8]).unwrap();
        let iter = tree.iter().unwrap();
        assert!(matches!(iter.value(), Err(StorageError::InvalidPosition(_))));
        assert!(iter.create_reader_for_current().is_err());
    }

    #[test]
    fn walks_large_tree_both_ways() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("large", 8).unwrap();
        for key in (0..5000i64).rev() {
            tree.add(key * 2, &key.to_le_bytes()).unwrap();
        }
        assert!(matches!(tree.shape().unwrap(), FixedTreeShape::Large { depth, .. } if depth >= 2));
        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(i64::MIN).unwrap());
        let mut seen = vec![iter.current_key().unwrap()];
        while iter.move_next().unwrap() {
            seen.push(iter.current_key().unwrap());
        }
        assert_eq!(seen, (0..5000).map(|k| k * 2).collect::<Vec<_>>());

        assert!(iter.seek_to_last().unwrap());
        assert_eq!(iter.current_key().unwrap(), 9998);
        let mut back = 1;
        while iter.move_prev().unwrap() {
            back += 1;
        }
        assert_eq!(back, 5000);

        assert!(iter.seek(1001).unwrap());
        assert_eq!(iter.current_key().unwrap(), 1002);
        let mut value = Vec::new();
        iter.create_reader_for_current()
            .unwrap()
            .read_to_end(&mut value)
            .unwrap();
        assert_eq!(value, 501i64.to_le_bytes());
    }

    #[test]
    fn skip_crosses_pages() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("skip", 8).unwrap();
        for key in 0..3000i64 {
            tree.add(key, &key.to_le_bytes()).unwrap();
        }
        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(10).unwrap());
        assert!(iter.skip(1000).unwrap());
        assert_eq!(iter.current_key().unwrap(), 1010);
        assert!(iter.skip(-1010).unwrap());
        assert_eq!(iter.current_key().unwrap(), 0);
        assert!(!iter.skip(5000).unwrap());
    }

    #[test]
    fn delete_while_iterating_root_tree_reseeks() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("root-owned", 8).unwrap();
        for key in 0..1000i64 {
            tree.add(key, &key.to_le_bytes()).unwrap();
        }
        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(0).unwrap());
        let mut deleted = 0;
        loop {
            if iter.current_key().unwrap() % 2 == 0 {
                deleted += 1;
                if !iter.delete_current_and_move_next().unwrap() {
                    break;
                }
            } else if !iter.move_next().unwrap() {
                break;
            }
        }
        assert_eq!(deleted, 500);
        drop(iter);
        assert_eq!(tree.number_of_entries().unwrap(), 500);
        assert!(!tree.contains(0).unwrap());
        assert!(tree.contains(999).unwrap());
    }

    #[test]
    fn delete_in_embedded_owner_keeps_position() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        tx.create_tree("parent").unwrap();
        let mut parent = tx.read_tree("parent").unwrap().unwrap();
        let mut tree = parent.fixed_tree_for(b"owner", 8).unwrap();
        assert_eq!(tree.owner_type(), RootObjectType::EmbeddedFixedSizeTree);
        for key in 0..600i64 {
            tree.add(key, &key.to_le_bytes()).unwrap();
        }
        assert!(matches!(tree.shape().unwrap(), FixedTreeShape::Large { .. }));

        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(5).unwrap());
        assert!(iter.delete_current_and_move_next().unwrap());
        // Entries shifted left into the kept slot.
        assert_eq!(iter.current_key().unwrap(), 6);

        // Deleting the last entry still reports success, but nothing follows
        // it.
        assert!(iter.seek_to_last().unwrap());
        assert!(iter.delete_current_and_move_next().unwrap());
        assert!(matches!(
            iter.current_key(),
            Err(StorageError::InvalidPosition(_))
        ));
        drop(iter);
        assert_eq!(tree.number_of_entries().unwrap(), 598);
    }

    /// Deletes every key below `limit` while walking the tree once from the
    /// start. Returns the keys stepped over.
    fn drain_below(iter: &mut FixedSizeTreeIterator<'_, '_, '_>, limit: i64) -> Vec<i64> {
        let mut kept = Vec::new();
        let mut more = iter.seek(i64::MIN).unwrap();
        while more {
            let key = iter.current_key().unwrap();
            more = if key < limit {
                iter.delete_current_and_move_next().unwrap() && iter.current_key().is_ok()
            } else {
                kept.push(key);
                iter.move_next().unwrap()
            };
        }
        kept
    }

    #[test]
    fn delete_across_leaves_in_embedded_owner_visits_every_key() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        tx.create_tree("parent").unwrap();
        let mut parent = tx.read_tree("parent").unwrap().unwrap();
        let mut tree = parent.fixed_tree_for(b"edges", 8).unwrap();
        for key in 0..765i64 {
            tree.add(key, &key.to_le_bytes()).unwrap();
        }
        assert!(matches!(tree.shape().unwrap(), FixedTreeShape::Large { depth, .. } if depth >= 2));

        let mut iter = tree.iter().unwrap();
        assert_eq!(drain_below(&mut iter, 300), (300..765).collect::<Vec<_>>());
        drop(iter);
        assert_eq!(tree.number_of_entries().unwrap(), 465);
        assert!(!tree.contains(299).unwrap());
        assert!(tree.contains(300).unwrap());
    }

    #[test]
    fn delete_through_root_collapse_keeps_walking() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        tx.create_tree("parent").unwrap();
        let mut parent = tx.read_tree("parent").unwrap().unwrap();
        let mut tree = parent.fixed_tree_for(b"edges", 8).unwrap();
        for key in 0..765i64 {
            tree.add(key, &key.to_le_bytes()).unwrap();
        }

        let mut iter = tree.iter().unwrap();
        assert_eq!(drain_below(&mut iter, 600), (600..765).collect::<Vec<_>>());
        drop(iter);
        assert!(matches!(
            tree.shape().unwrap(),
            FixedTreeShape::Large { depth: 1, page_count: 1 }
        ));
        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(0).unwrap());
        assert_eq!(iter.current_key().unwrap(), 600);
        assert_eq!(iter.value().unwrap(), 600i64.to_le_bytes());
    }

    #[test]
    fn delete_across_leaves_in_root_tree_visits_every_key() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("wide", 8).unwrap();
        for key in 0..765i64 {
            tree.add(key, &key.to_le_bytes()).unwrap();
        }
        let mut iter = tree.iter().unwrap();
        assert_eq!(drain_below(&mut iter, 600), (600..765).collect::<Vec<_>>());
        drop(iter);
        assert_eq!(tree.number_of_entries().unwrap(), 165);
    }

    #[test]
    fn delete_in_embedded_shape_reseeks() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        tx.create_tree("parent").unwrap();
        let mut parent = tx.read_tree("parent").unwrap().unwrap();
        let mut tree = parent.fixed_tree_for(b"small", 8).unwrap();
        for key in [10, 20, 30] {
            tree.add(key, &[0; 8]).unwrap();
        }
        let mut iter = tree.iter().unwrap();
        assert!(iter.seek(20).unwrap());
        assert!(iter.delete_current_and_move_next().unwrap());
        assert_eq!(iter.current_key().unwrap(), 30);
        assert!(!iter.delete_current_and_move_next().unwrap());
        assert!(iter.seek(0).unwrap());
        assert!(!iter.delete_current_and_move_next().unwrap());
        assert!(!iter.seek(0).unwrap());
        drop(iter);
        assert_eq!(tree.shape().unwrap(), FixedTreeShape::Empty);
    }
}
