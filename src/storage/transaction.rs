#![forbid(unsafe_code)]
//! Named-tree transactions.
//!
//! A [`Transaction`] wraps a [`LowLevelTransaction`] and caches every tree it
//! opened, including the trees it found missing. Multi-value keys are backed
//! by nested trees kept in a second cache keyed by `(parent, key)`. Nothing
//! cached is written to the root-object tree until commit runs its prepare
//! phase.

use std::mem;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::storage::fixed::slot::FixedSlot;
use crate::storage::fixed::{FixedOwner, FixedTree};
use crate::storage::free_space;
use crate::storage::header::{tree_flags, TreeRootHeader};
use crate::storage::llt::{LowLevelTransaction, TransactionFlags, TxPages};
use crate::storage::tree::{self, collect_keys, record_flags, Tree, TreeIterator, TreeRecord};
use crate::types::{
    Result, RootObjectType, StorageError, TxId, FREE_SPACE_TREE_NAME, ROOT_TREE_NAME,
};

/// Hook run during the prepare phase of a commit.
pub trait CommitParticipant {
    /// Whether [`CommitParticipant::prepare`] must run for this commit.
    fn requires_participation(&self) -> bool {
        true
    }

    /// Writes the participant's pending state through `tx` before the page
    /// transaction commits.
    fn prepare(&mut self, tx: &mut Transaction<'_>) -> Result<()>;
}

/// Transaction over the named trees of a store.
pub struct Transaction<'env> {
    llt: LowLevelTransaction<'env>,
    trees: FxHashMap<String, Option<Tree>>,
    multi_value_trees: FxHashMap<(String, Vec<u8>), Tree>,
    participants: Vec<Box<dyn CommitParticipant + 'env>>,
    disposed: bool,
}

fn reserved(name: &str) -> bool {
    name == ROOT_TREE_NAME || name == FREE_SPACE_TREE_NAME
}

fn nested_tree_name(parent: &str, key: &[u8]) -> String {
    format!("{parent}/{}", hex::encode(key))
}

impl<'env> Transaction<'env> {
    pub(crate) fn new(llt: LowLevelTransaction<'env>) -> Self {
        Self {
            llt,
            trees: FxHashMap::default(),
            multi_value_trees: FxHashMap::default(),
            participants: Vec::new(),
            disposed: false,
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed {
            return Err(StorageError::Disposed("transaction"));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.llt.flags() != TransactionFlags::ReadWrite {
            return Err(StorageError::Invalid("operation requires a write transaction"));
        }
        Ok(())
    }

    /// Underlying page transaction.
    pub fn low_level(&self) -> Result<&LowLevelTransaction<'env>> {
        self.ensure_alive()?;
        Ok(&self.llt)
    }

    /// Transaction id.
    pub fn id(&self) -> Result<TxId> {
        self.ensure_alive()?;
        Ok(self.llt.id())
    }

    /// Whether this is the write transaction.
    pub fn is_writable(&self) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.llt.flags() == TransactionFlags::ReadWrite)
    }

    /// Page size of the store.
    pub fn page_size(&self) -> Result<usize> {
        self.ensure_alive()?;
        Ok(self.llt.pages().page_size())
    }

    pub(crate) fn pages(&self) -> Result<&TxPages<'env>> {
        self.ensure_alive()?;
        Ok(self.llt.pages())
    }

    pub(crate) fn pages_mut(&mut self) -> Result<&mut TxPages<'env>> {
        self.ensure_alive()?;
        Ok(self.llt.pages_mut())
    }

    /// Loads `name` into the tree cache. Returns whether the tree exists.
    fn load_tree(&mut self, name: &str) -> Result<bool> {
        self.ensure_alive()?;
        if let Some(cached) = self.trees.get(name) {
            return Ok(cached.is_some());
        }
        let (root, pages) = self.llt.root_and_pages();
        let tree = match root.read_record(pages, name.as_bytes())? {
            None => None,
            Some(record) if record.flags == record_flags::DATA => {
                Some(Tree::open(name, TreeRootHeader::decode(&record.value)?))
            }
            Some(_) => {
                return Err(StorageError::Invalid(
                    "root object is not a variable-size tree",
                ))
            }
        };
        let exists = tree.is_some();
        self.trees.insert(name.to_owned(), tree);
        Ok(exists)
    }

    /// Cached tree `name` and the page view, borrowed together.
    fn tree_parts(&mut self, name: &str) -> Result<(&mut Tree, &mut TxPages<'env>)> {
        if !self.load_tree(name)? {
            return Err(StorageError::NotFound(name.to_owned()));
        }
        let tree = self
            .trees
            .get_mut(name)
            .and_then(Option::as_mut)
            .ok_or_else(|| StorageError::NotFound(name.to_owned()))?;
        Ok((tree, self.llt.pages_mut()))
    }

    /// Opens an existing variable-size tree.
    pub fn read_tree(&mut self, name: &str) -> Result<Option<TreeMut<'_, 'env>>> {
        if !self.load_tree(name)? {
            return Ok(None);
        }
        Ok(Some(TreeMut {
            tx: self,
            name: name.to_owned(),
        }))
    }

    /// Opens `name`, creating it when missing. The new tree's root record is
    /// written to the root-object tree immediately.
    pub fn create_tree(&mut self, name: &str) -> Result<TreeMut<'_, 'env>> {
        self.ensure_writable()?;
        if name.is_empty() || reserved(name) {
            return Err(StorageError::Invalid("tree name is reserved"));
        }
        if !self.load_tree(name)? {
            let (root, pages) = self.llt.root_and_pages();
            let mut tree = Tree::create(name);
            tree.ensure_root(pages)?;
            root.add_record(pages, name.as_bytes(), record_flags::DATA, &tree.header().encode())?;
            tree.mark_clean();
            debug!(tree = name, "storage.tree.created");
            self.trees.insert(name.to_owned(), Some(tree));
        }
        Ok(TreeMut {
            tx: self,
            name: name.to_owned(),
        })
    }

    /// Deletes the root object `name`, releasing every page it owns,
    /// nested structures included. Returns whether it existed.
    pub fn delete_tree(&mut self, name: &str) -> Result<bool> {
        self.ensure_writable()?;
        if reserved(name) {
            return Err(StorageError::Invalid("tree name is reserved"));
        }
        let record = {
            let (root, pages) = self.llt.root_and_pages();
            root.read_record(pages, name.as_bytes())?
        };
        let Some(record) = record else {
            return Ok(false);
        };
        if record.flags == record_flags::DATA {
            self.flush_multi_value_trees()?;
            self.multi_value_trees.retain(|(parent, _), _| parent != name);
            let mut tree = match self.trees.remove(name).flatten() {
                Some(tree) => tree,
                None => Tree::open(name, TreeRootHeader::decode(&record.value)?),
            };
            tree.free_all(self.llt.pages_mut())?;
        } else {
            tree::free_payload(self.llt.pages_mut(), record.flags, &record.value)?;
        }
        let (root, pages) = self.llt.root_and_pages();
        root.delete(pages, name.as_bytes())?;
        self.trees.insert(name.to_owned(), None);
        debug!(tree = name, "storage.tree.deleted");
        Ok(true)
    }

    /// Renames a root object. Fails when `to` exists or either name is
    /// reserved.
    pub fn rename_tree(&mut self, from: &str, to: &str) -> Result<()> {
        self.ensure_writable()?;
        if reserved(from) || reserved(to) || to.is_empty() {
            return Err(StorageError::Invalid("tree name is reserved"));
        }
        let (root, pages) = self.llt.root_and_pages();
        if root.contains(pages, to.as_bytes())? {
            return Err(StorageError::TreeExists(to.to_owned()));
        }
        let record = root
            .delete(pages, from.as_bytes())?
            .ok_or_else(|| StorageError::NotFound(from.to_owned()))?;
        let moved = match self.trees.remove(from).flatten() {
            Some(mut tree) => {
                tree.set_name(to);
                root.add_record(pages, to.as_bytes(), record_flags::DATA, &tree.header().encode())?;
                tree.mark_clean();
                Some(tree)
            }
            None => {
                root.add_record(pages, to.as_bytes(), record.flags, &record.value)?;
                (record.flags == record_flags::DATA)
                    .then(|| TreeRootHeader::decode(&record.value).map(|h| Tree::open(to, h)))
                    .transpose()?
            }
        };
        self.trees.insert(from.to_owned(), None);
        self.trees.insert(to.to_owned(), moved);
        let rekeyed: Vec<(String, Vec<u8>)> = self
            .multi_value_trees
            .keys()
            .filter(|(parent, _)| parent == from)
            .cloned()
            .collect();
        for old in rekeyed {
            if let Some(mut nested) = self.multi_value_trees.remove(&old) {
                nested.set_name(nested_tree_name(to, &old.1));
                self.multi_value_trees.insert((to.to_owned(), old.1), nested);
            }
        }
        debug!(from, to, "storage.tree.renamed");
        Ok(())
    }

    /// Fixed-size tree registered under `name` in the root-object tree. The
    /// tree is created by its first insert.
    pub fn fixed_tree_for(&mut self, name: &str, value_size: u16) -> Result<FixedTree<'_, 'env>> {
        self.ensure_alive()?;
        if name.is_empty() || reserved(name) {
            return Err(StorageError::Invalid("tree name is reserved"));
        }
        FixedTree::open(self, FixedOwner::Root(name.to_owned()), value_size)
    }

    /// Value width of the fixed-size tree registered under `name`, if any.
    pub fn fixed_tree_value_size(&mut self, name: &str) -> Result<Option<u16>> {
        match self.read_fixed_slot(&FixedOwner::Root(name.to_owned()))? {
            Some(bytes) => Ok(Some(FixedSlot::decode(&bytes)?.value_size)),
            None => Ok(None),
        }
    }

    pub(crate) fn free_space_tree(&mut self) -> Result<FixedTree<'_, 'env>> {
        FixedTree::open(self, FixedOwner::Root(FREE_SPACE_TREE_NAME.to_owned()), 0)
    }

    /// Every root object in name order with its kind.
    pub fn root_objects(&mut self) -> Result<Vec<(String, RootObjectType)>> {
        self.ensure_alive()?;
        let (root, pages) = self.llt.root_and_pages();
        let mut out = Vec::with_capacity(root.number_of_entries() as usize);
        let mut iter = root.iter(pages);
        let mut more = iter.seek_first()?;
        while more {
            let record = iter.current()?;
            let kind = match record.value.first() {
                Some(tag) => RootObjectType::from_u8(*tag)?,
                None => RootObjectType::None,
            };
            out.push((String::from_utf8_lossy(record.key).into_owned(), kind));
            more = iter.move_next()?;
        }
        Ok(out)
    }

    /// Registers a hook run during prepare.
    pub fn register(&mut self, participant: Box<dyn CommitParticipant + 'env>) -> Result<()> {
        self.ensure_alive()?;
        self.participants.push(participant);
        Ok(())
    }

    pub(crate) fn read_fixed_slot(&mut self, owner: &FixedOwner) -> Result<Option<Vec<u8>>> {
        self.ensure_alive()?;
        let record = match owner {
            FixedOwner::Root(name) => {
                let (root, pages) = self.llt.root_and_pages();
                root.read_record(pages, name.as_bytes())?
            }
            FixedOwner::Embedded { tree, key } => {
                let (tree, pages) = self.tree_parts(tree)?;
                tree.read_record(pages, key)?
            }
        };
        match record {
            None => Ok(None),
            Some(TreeRecord { flags, value }) if flags == record_flags::FIXED_SIZE_TREE => {
                Ok(Some(value))
            }
            Some(_) => Err(StorageError::Invalid("key does not hold a fixed-size tree")),
        }
    }

    pub(crate) fn write_fixed_slot(&mut self, owner: &FixedOwner, slot: Option<&[u8]>) -> Result<()> {
        self.ensure_writable()?;
        let (tree, pages, key) = match owner {
            FixedOwner::Root(name) => {
                let (root, pages) = self.llt.root_and_pages();
                (root, pages, name.as_bytes())
            }
            FixedOwner::Embedded { tree, key } => {
                let (tree, pages) = self.tree_parts(tree)?;
                (tree, pages, key.as_slice())
            }
        };
        match slot {
            Some(slot) => {
                tree.add_record(pages, key, record_flags::FIXED_SIZE_TREE, slot)?;
            }
            None => {
                tree.delete(pages, key)?;
            }
        }
        Ok(())
    }

    /// Writes every modified nested tree's root into its parent.
    fn flush_multi_value_trees(&mut self) -> Result<()> {
        let pages = self.llt.pages_mut();
        for ((parent, key), nested) in self.multi_value_trees.iter_mut() {
            if !nested.is_modified() {
                continue;
            }
            let parent_tree = self
                .trees
                .get_mut(parent)
                .and_then(Option::as_mut)
                .ok_or_else(|| StorageError::NotFound(parent.clone()))?;
            parent_tree.add_record(
                pages,
                key,
                record_flags::MULTI_VALUE,
                &nested.header().encode(),
            )?;
            nested.mark_clean();
        }
        Ok(())
    }

    /// Writes every modified tree's root into the root-object tree.
    fn flush_trees(&mut self) -> Result<()> {
        let (root, pages) = self.llt.root_and_pages();
        for (name, tree) in self.trees.iter_mut() {
            let Some(tree) = tree else { continue };
            if !tree.is_modified() {
                continue;
            }
            root.add_record(pages, name.as_bytes(), record_flags::DATA, &tree.header().encode())?;
            tree.mark_clean();
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.flush_multi_value_trees()?;
        self.flush_trees()?;
        let mut participants = mem::take(&mut self.participants);
        for participant in participants.iter_mut() {
            if participant.requires_participation() {
                participant.prepare(self)?;
            }
        }
        self.participants = participants;
        self.flush_multi_value_trees()?;
        self.flush_trees()?;
        free_space::record_freed_pages(self)?;
        Ok(())
    }

    /// Runs the prepare phase and commits the page transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.prepare()?;
        self.llt.commit()?;
        self.trees.clear();
        self.multi_value_trees.clear();
        self.participants.clear();
        Ok(())
    }

    /// Ends the transaction. Uncommitted changes are discarded. Every later
    /// call on this transaction fails with `Disposed`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.llt.dispose();
        self.trees.clear();
        self.multi_value_trees.clear();
        self.participants.clear();
        self.disposed = true;
    }
}

/// Handle to one variable-size tree of a [`Transaction`].
pub struct TreeMut<'t, 'env> {
    tx: &'t mut Transaction<'env>,
    name: String,
}

impl<'t, 'env> TreeMut<'t, 'env> {
    /// Tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn parts(&mut self) -> Result<(&mut Tree, &mut TxPages<'env>)> {
        self.tx.tree_parts(&self.name)
    }

    /// Current root header.
    pub fn header(&mut self) -> Result<TreeRootHeader> {
        Ok(*self.parts()?.0.header())
    }

    /// Number of keys in the tree.
    pub fn number_of_entries(&mut self) -> Result<u64> {
        Ok(self.parts()?.0.number_of_entries())
    }

    /// Releases whatever the record previously stored under `key` owned.
    fn release_nested(&mut self, key: &[u8], previous: Option<TreeRecord>) -> Result<()> {
        let cached = self
            .tx
            .multi_value_trees
            .remove(&(self.name.clone(), key.to_vec()));
        let Some(previous) = previous else {
            return Ok(());
        };
        let pages = self.tx.llt.pages_mut();
        match (previous.flags, cached) {
            (record_flags::MULTI_VALUE, Some(mut nested)) => nested.free_all(pages),
            (flags, _) => tree::free_payload(pages, flags, &previous.value),
        }
    }

    /// Stores a plain value, replacing whatever `key` held before.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        let previous = {
            let (tree, pages) = self.parts()?;
            tree.add_record(pages, key, record_flags::DATA, value)?
        };
        self.release_nested(key, previous)
    }

    /// Removes `key` and everything nested under it.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.tx.ensure_writable()?;
        let previous = {
            let (tree, pages) = self.parts()?;
            tree.delete(pages, key)?
        };
        let removed = previous.is_some();
        self.release_nested(key, previous)?;
        Ok(removed)
    }

    /// Plain value under `key`.
    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (tree, pages) = self.parts()?;
        tree.read(pages, key)
    }

    /// Record under `key`, nested or not.
    pub fn read_record(&mut self, key: &[u8]) -> Result<Option<TreeRecord>> {
        let (tree, pages) = self.parts()?;
        tree.read_record(pages, key)
    }

    /// Nested tree for `key`, loading or creating it. A plain value already
    /// stored under `key` becomes the first value of the new nested tree.
    fn nested_for_write(&mut self, key: &[u8]) -> Result<()> {
        let cache_key = (self.name.clone(), key.to_vec());
        if self.tx.multi_value_trees.contains_key(&cache_key) {
            return Ok(());
        }
        let nested_name = nested_tree_name(&self.name, key);
        let (tree, pages) = self.tx.tree_parts(&self.name)?;
        let nested = match tree.read_record(pages, key)? {
            Some(record) if record.flags == record_flags::MULTI_VALUE => {
                Tree::open(nested_name, TreeRootHeader::decode(&record.value)?)
            }
            Some(record) if record.flags == record_flags::FIXED_SIZE_TREE => {
                return Err(StorageError::Invalid("key holds a fixed-size tree"));
            }
            existing => {
                let mut nested = Tree::create_nested(nested_name);
                if let Some(record) = existing {
                    nested.add(pages, &record.value, &[])?;
                }
                tree.add_record(pages, key, record_flags::MULTI_VALUE, &nested.header().encode())?;
                tree.add_header_flags(tree_flags::MULTI_VALUE_TREES);
                nested
            }
        };
        self.tx.multi_value_trees.insert(cache_key, nested);
        Ok(())
    }

    /// Adds `value` to the set of values stored under `key`.
    pub fn multi_add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        if value.is_empty() {
            return Err(StorageError::Invalid("multi-values must not be empty"));
        }
        self.nested_for_write(key)?;
        let nested = self
            .tx
            .multi_value_trees
            .get_mut(&(self.name.clone(), key.to_vec()))
            .ok_or(StorageError::Invalid("multi-value tree missing from cache"))?;
        nested.add(self.tx.llt.pages_mut(), value, &[])
    }

    /// Removes `value` from the values under `key`. The key disappears with
    /// its last value.
    pub fn multi_delete(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.tx.ensure_writable()?;
        let record = {
            let (tree, pages) = self.parts()?;
            tree.read_record(pages, key)?
        };
        match record {
            None => Ok(false),
            Some(record) if record.flags == record_flags::DATA => {
                if record.value != value {
                    return Ok(false);
                }
                let (tree, pages) = self.parts()?;
                tree.delete(pages, key)?;
                Ok(true)
            }
            Some(record) if record.flags == record_flags::MULTI_VALUE => {
                self.nested_for_write(key)?;
                let cache_key = (self.name.clone(), key.to_vec());
                let pages = self.tx.llt.pages_mut();
                let nested = self
                    .tx
                    .multi_value_trees
                    .get_mut(&cache_key)
                    .ok_or(StorageError::Invalid("multi-value tree missing from cache"))?;
                if nested.delete(pages, value)?.is_none() {
                    return Ok(false);
                }
                if nested.number_of_entries() == 0 {
                    nested.free_all(pages)?;
                    self.tx.multi_value_trees.remove(&cache_key);
                    let (tree, pages) = self.parts()?;
                    tree.delete(pages, key)?;
                }
                Ok(true)
            }
            Some(_) => Err(StorageError::Invalid("key holds a fixed-size tree")),
        }
    }

    /// Every value stored under `key`, in order.
    pub fn multi_read(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cache_key = (self.name.clone(), key.to_vec());
        if let Some(nested) = self.tx.multi_value_trees.get(&cache_key) {
            return collect_keys(nested, self.tx.llt.pages());
        }
        let (tree, pages) = self.parts()?;
        match tree.read_record(pages, key)? {
            None => Ok(Vec::new()),
            Some(record) if record.flags == record_flags::DATA => Ok(vec![record.value]),
            Some(record) if record.flags == record_flags::MULTI_VALUE => {
                let nested = Tree::open("", TreeRootHeader::decode(&record.value)?);
                collect_keys(&nested, pages)
            }
            Some(_) => Err(StorageError::Invalid("key holds a fixed-size tree")),
        }
    }

    /// Cursor over the tree's records. Pending nested trees are written into
    /// their records first so the cursor sees them.
    pub fn iter(&mut self) -> Result<TreeIterator<'_>> {
        if self.tx.is_writable()? {
            self.tx.flush_multi_value_trees()?;
        }
        let (tree, pages) = self.parts()?;
        let root = tree.header().root_page;
        Ok(TreeIterator::new(pages, root))
    }

    /// Fixed-size tree stored under `key` of this tree.
    pub fn fixed_tree_for(&mut self, key: &[u8], value_size: u16) -> Result<FixedTree<'_, 'env>> {
        if key.is_empty() {
            return Err(StorageError::Invalid("tree keys must not be empty"));
        }
        let owner = FixedOwner::Embedded {
            tree: self.name.clone(),
            key: key.to_vec(),
        };
        FixedTree::open(self.tx, owner, value_size)
    }
}
