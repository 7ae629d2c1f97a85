#![forbid(unsafe_code)]
//! Fixed-size trees: `i64` keys mapped to values of one fixed width.
//!
//! Small trees live embedded in their owner's record as a packed, sorted
//! array. Once they outgrow [`slot::EMBEDDED_BUDGET`] bytes they move to a
//! paged B-tree and stay there. Every mutation writes the tree's slot back to
//! its owner, so the owner always describes the current shape.

mod iter;
mod large;
pub mod page;
pub mod slot;

pub use iter::{FixedSizeTreeIterator, ValueReader};

use tracing::debug;

use crate::storage::llt::TxPages;
use crate::storage::transaction::Transaction;
use crate::types::{Result, RootObjectType, StorageError};

use slot::{FixedSlot, SlotShape};

/// Where a fixed-size tree's slot is stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum FixedOwner {
    /// Registered by name in the root-object tree.
    Root(String),
    /// Stored under `key` of the variable-size tree `tree`.
    Embedded { tree: String, key: Vec<u8> },
}

impl FixedOwner {
    fn object_type(&self) -> RootObjectType {
        match self {
            FixedOwner::Root(_) => RootObjectType::FixedSizeTree,
            FixedOwner::Embedded { .. } => RootObjectType::EmbeddedFixedSizeTree,
        }
    }
}

/// Storage shape of a fixed-size tree, for inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FixedTreeShape {
    /// No entries.
    Empty,
    /// Entries packed in the owner's record.
    Embedded,
    /// Entries in dedicated pages.
    Large {
        /// Levels of the paged tree.
        depth: u32,
        /// Pages owned by the tree.
        page_count: u64,
    },
}

/// Handle to one fixed-size tree inside a write or read transaction.
pub struct FixedTree<'t, 'env> {
    tx: &'t mut Transaction<'env>,
    owner: FixedOwner,
    value_size: u16,
}

impl<'t, 'env> FixedTree<'t, 'env> {
    pub(crate) fn open(
        tx: &'t mut Transaction<'env>,
        owner: FixedOwner,
        value_size: u16,
    ) -> Result<Self> {
        if value_size as usize > page::max_value_size(tx.page_size()?) {
            return Err(StorageError::Invalid("fixed-size tree value size too large"));
        }
        let mut tree = Self {
            tx,
            owner,
            value_size,
        };
        let slot = tree.load()?;
        if slot.value_size != value_size {
            return Err(StorageError::Invalid(
                "fixed-size tree exists with a different value size",
            ));
        }
        if slot.object_type != tree.owner.object_type() {
            return Err(StorageError::Corruption("fixed-size tree slot has the wrong type"));
        }
        Ok(tree)
    }

    /// Width of every value.
    pub fn value_size(&self) -> u16 {
        self.value_size
    }

    /// `FixedSizeTree` for trees registered in the root-object tree,
    /// `EmbeddedFixedSizeTree` for trees stored under a key of another tree.
    pub fn owner_type(&self) -> RootObjectType {
        self.owner.object_type()
    }

    pub(crate) fn load(&mut self) -> Result<FixedSlot> {
        match self.tx.read_fixed_slot(&self.owner)? {
            Some(bytes) => FixedSlot::decode(&bytes),
            None => Ok(FixedSlot::empty(self.owner.object_type(), self.value_size)),
        }
    }

    fn store(&mut self, slot: &FixedSlot) -> Result<()> {
        let encoded = slot.encode()?;
        self.tx.write_fixed_slot(&self.owner, encoded.as_deref())
    }

    pub(crate) fn pages(&self) -> Result<&TxPages<'env>> {
        self.tx.pages()
    }

    /// Current storage shape.
    pub fn shape(&mut self) -> Result<FixedTreeShape> {
        Ok(match self.load()?.shape {
            SlotShape::Empty => FixedTreeShape::Empty,
            SlotShape::Embedded(_) => FixedTreeShape::Embedded,
            SlotShape::Large(root) => FixedTreeShape::Large {
                depth: root.depth,
                page_count: root.page_count,
            },
        })
    }

    /// Number of entries.
    pub fn number_of_entries(&mut self) -> Result<u64> {
        Ok(self.load()?.number_of_entries())
    }

    /// Inserts or overwrites `key`. Returns whether a new entry was created.
    pub fn add(&mut self, key: i64, value: &[u8]) -> Result<bool> {
        if value.len() != self.value_size as usize {
            return Err(StorageError::Invalid("value does not match the tree's value size"));
        }
        let mut slot = self.load()?;
        let value_size = self.value_size;
        if slot.shape == SlotShape::Empty {
            slot.shape = SlotShape::Embedded(Vec::with_capacity(slot::entry_len(value_size)));
        }
        let inserted = match &mut slot.shape {
            SlotShape::Large(root) => large::add(self.tx.pages_mut()?, root, value_size, key, value)?,
            SlotShape::Embedded(data) => {
                let (pos, exact) = slot::search(data, value_size, key)?;
                if exact {
                    let at = pos * slot::entry_len(value_size) + 8;
                    data[at..at + value_size as usize].copy_from_slice(value);
                    false
                } else {
                    slot::insert_at(data, value_size, pos, key, value);
                    true
                }
            }
            SlotShape::Empty => false,
        };
        if let SlotShape::Embedded(data) = &slot.shape {
            if data.len() / slot::entry_len(value_size) > FixedSlot::embedded_capacity(value_size) {
                let root = large::create(self.tx.pages_mut()?, value_size, data)?;
                debug!(entries = root.entries, "storage.fixed_tree.migrated");
                slot.shape = SlotShape::Large(root);
            }
        }
        self.store(&slot)?;
        Ok(inserted)
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&mut self, key: i64) -> Result<bool> {
        let mut slot = self.load()?;
        let value_size = self.value_size;
        let removed = match &mut slot.shape {
            SlotShape::Empty => false,
            SlotShape::Embedded(data) => match slot::search(data, value_size, key)? {
                (pos, true) => {
                    slot::remove_at(data, value_size, pos);
                    true
                }
                _ => false,
            },
            SlotShape::Large(root) => large::delete(self.tx.pages_mut()?, root, key)?,
        };
        if !removed {
            return Ok(false);
        }
        if matches!(&slot.shape, SlotShape::Embedded(data) if data.is_empty()) {
            slot.shape = SlotShape::Empty;
        }
        self.store(&slot)?;
        Ok(true)
    }

    /// Removes every key in `start..=end`. Returns how many were removed.
    pub fn delete_range(&mut self, start: i64, end: i64) -> Result<u64> {
        if start > end {
            return Ok(0);
        }
        let mut slot = self.load()?;
        let value_size = self.value_size;
        let removed = match &mut slot.shape {
            SlotShape::Empty => 0,
            SlotShape::Embedded(data) => {
                let (from, _) = slot::search(data, value_size, start)?;
                let (mut to, exact) = slot::search(data, value_size, end)?;
                if exact {
                    to += 1;
                }
                let len = slot::entry_len(value_size);
                data.drain(from * len..to * len);
                (to - from) as u64
            }
            SlotShape::Large(root) => {
                let pages = self.tx.pages_mut()?;
                let keys = large::keys_in_range(pages, root, start, end)?;
                for key in &keys {
                    large::delete(pages, root, *key)?;
                }
                keys.len() as u64
            }
        };
        if removed == 0 {
            return Ok(0);
        }
        if matches!(&slot.shape, SlotShape::Embedded(data) if data.is_empty()) {
            slot.shape = SlotShape::Empty;
        }
        self.store(&slot)?;
        debug!(start, end, removed, "storage.fixed_tree.range_deleted");
        Ok(removed)
    }

    /// Value stored under `key`.
    pub fn read(&mut self, key: i64) -> Result<Option<Vec<u8>>> {
        let slot = self.load()?;
        match &slot.shape {
            SlotShape::Empty => Ok(None),
            SlotShape::Embedded(data) => match slot::search(data, slot.value_size, key)? {
                (pos, true) => Ok(Some(slot::value_at(data, slot.value_size, pos)?.to_vec())),
                _ => Ok(None),
            },
            SlotShape::Large(root) => large::read(self.tx.pages()?, root, key),
        }
    }

    /// Whether `key` is present.
    pub fn contains(&mut self, key: i64) -> Result<bool> {
        Ok(self.read(key)?.is_some())
    }

    /// Cursor over the tree. The cursor borrows the handle, so the tree can
    /// be modified through it but not around it.
    pub fn iter(&mut self) -> Result<FixedSizeTreeIterator<'_, 't, 'env>> {
        FixedSizeTreeIterator::new(self)
    }
}

/// Releases the pages of the tree described by a stored slot.
pub(crate) fn free_slot_pages(pages: &mut TxPages<'_>, slot: &[u8]) -> Result<()> {
    if let SlotShape::Large(root) = FixedSlot::decode(slot)?.shape {
        for page_id in large::collect_pages(pages, &root)? {
            pages.free(page_id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::storage::{StorageEnvironment, StorageOptions};

    fn env() -> (tempfile::TempDir, StorageEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        let env = StorageEnvironment::open(
            StorageOptions::new(dir.path()).sync_journal(false).manual_flush(true),
        )
        .unwrap();
        (dir, env)
    }

    fn keys(tree: &mut FixedTree<'_, '_>) -> Vec<i64> {
        let mut out = Vec::new();
        let mut iter = tree.iter().unwrap();
        let mut more = iter.seek(i64::MIN).unwrap();
        while more {
            out.push(iter.current_key().unwrap());
            more = iter.move_next().unwrap();
        }
        out
    }

    #[test]
    fn delete_range_in_embedded_slot() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("small", 8).unwrap();
        for key in [1, 3, 5, 7, 9] {
            tree.add(key, &[key as u8; 8]).unwrap();
        }
        assert_eq!(tree.delete_range(5, 1).unwrap(), 0);
        assert_eq!(tree.delete_range(2, 7).unwrap(), 3);
        assert_eq!(keys(&mut tree), vec![1, 9]);
        assert_eq!(tree.shape().unwrap(), FixedTreeShape::Embedded);
        assert_eq!(tree.delete_range(10, 20).unwrap(), 0);
        assert_eq!(tree.delete_range(i64::MIN, i64::MAX).unwrap(), 2);
        assert_eq!(tree.shape().unwrap(), FixedTreeShape::Empty);
    }

    #[test]
    fn delete_range_after_migration_to_pages() {
        let (_dir, env) = env();
        let mut tx = env.write_transaction().unwrap();
        let mut tree = tx.fixed_tree_for("grown", 8).unwrap();
        let capacity = FixedSlot::embedded_capacity(8) as i64;
        let mut model = BTreeSet::new();
        for key in 0..=capacity {
            tree.add(key, &key.to_le_bytes()).unwrap();
            model.insert(key);
        }
        assert!(matches!(tree.shape().unwrap(), FixedTreeShape::Large { depth: 1, .. }));

        // Shrinking below the embedded capacity keeps the paged shape.
        assert_eq!(tree.delete_range(1, capacity - 1).unwrap(), (capacity - 1) as u64);
        model.retain(|key| !(1..capacity).contains(key));
        assert!(matches!(tree.shape().unwrap(), FixedTreeShape::Large { .. }));
        assert_eq!(tree.read(capacity).unwrap(), Some(capacity.to_le_bytes().to_vec()));

        for key in capacity + 1..2000 {
            tree.add(key, &key.to_le_bytes()).unwrap();
            model.insert(key);
        }
        let expected = model.range(100..=1500).count() as u64;
        assert_eq!(tree.delete_range(100, 1500).unwrap(), expected);
        model.retain(|key| !(100..=1500).contains(key));

        assert_eq!(keys(&mut tree), model.iter().copied().collect::<Vec<_>>());
        assert_eq!(tree.number_of_entries().unwrap(), model.len() as u64);
        assert!(tree.add(1000, &1000i64.to_le_bytes()).unwrap());
    }
}
