use crate::storage::header::TreeRootHeader;
use crate::storage::llt::{PageRef, TxPages};
use crate::storage::tree::page::{self, LeafRecord, NodeKind};
use crate::storage::tree::{record_flags, Tree, TreePath};
use crate::types::{PageId, Result, StorageError};

/// Cursor over the records of a variable-size tree.
///
/// The cursor keeps the chain of branch pages it descended through instead of
/// relying on sibling links, so moving past the end of a leaf climbs back up
/// and descends into the neighbouring child.
pub struct TreeIterator<'a> {
    pages: &'a TxPages<'a>,
    root: Option<PageId>,
    stack: TreePath,
    leaf: Option<(PageRef<'a>, usize)>,
}

enum Edge {
    First,
    Last,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(pages: &'a TxPages<'a>, root: Option<PageId>) -> Self {
        Self {
            pages,
            root,
            stack: TreePath::new(),
            leaf: None,
        }
    }

    /// Positions on the first record whose key is `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        let Some(mut current) = self.root else {
            return Ok(false);
        };
        loop {
            let buf = self.pages.read(current)?;
            match page::kind(&buf)? {
                NodeKind::Branch => {
                    let idx = page::search_branch(&buf, key)?;
                    self.stack.push((current, idx));
                    current = page::branch_child(&buf, idx)?;
                }
                NodeKind::Leaf => {
                    let (pos, _) = page::search_leaf(&buf, key)?;
                    let count = page::entry_count(&buf)?;
                    self.leaf = Some((buf, pos));
                    if pos < count {
                        return Ok(true);
                    }
                    return self.climb(Edge::First);
                }
            }
        }
    }

    /// Positions on the smallest record.
    pub fn seek_first(&mut self) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        match self.root {
            Some(root) => self.descend(root, Edge::First),
            None => Ok(false),
        }
    }

    /// Positions on the largest record.
    pub fn seek_last(&mut self) -> Result<bool> {
        self.stack.clear();
        self.leaf = None;
        match self.root {
            Some(root) => self.descend(root, Edge::Last),
            None => Ok(false),
        }
    }

    /// Advances to the next record.
    pub fn move_next(&mut self) -> Result<bool> {
        let Some((buf, idx)) = &mut self.leaf else {
            return Ok(false);
        };
        if *idx + 1 < page::entry_count(buf)? {
            *idx += 1;
            return Ok(true);
        }
        self.climb(Edge::First)
    }

    /// Steps back to the previous record.
    pub fn move_prev(&mut self) -> Result<bool> {
        let Some((_, idx)) = &mut self.leaf else {
            return Ok(false);
        };
        if *idx > 0 {
            *idx -= 1;
            return Ok(true);
        }
        self.climb(Edge::Last)
    }

    fn descend(&mut self, mut current: PageId, edge: Edge) -> Result<bool> {
        loop {
            let buf = self.pages.read(current)?;
            let count = page::entry_count(&buf)?;
            match page::kind(&buf)? {
                NodeKind::Branch => {
                    let idx = match edge {
                        Edge::First => 0,
                        Edge::Last => count
                            .checked_sub(1)
                            .ok_or(StorageError::Corruption("empty branch page"))?,
                    };
                    self.stack.push((current, idx));
                    current = page::branch_child(&buf, idx)?;
                }
                NodeKind::Leaf => {
                    if count == 0 {
                        self.leaf = None;
                        return Ok(false);
                    }
                    let idx = match edge {
                        Edge::First => 0,
                        Edge::Last => count - 1,
                    };
                    self.leaf = Some((buf, idx));
                    return Ok(true);
                }
            }
        }
    }

    /// Moves to the first record of the next leaf (`Edge::First`) or the last
    /// record of the previous one (`Edge::Last`).
    fn climb(&mut self, edge: Edge) -> Result<bool> {
        while let Some((branch, idx)) = self.stack.pop() {
            let buf = self.pages.read(branch)?;
            let count = page::entry_count(&buf)?;
            let next = match edge {
                Edge::First if idx + 1 < count => Some(idx + 1),
                Edge::Last if idx > 0 => Some(idx - 1),
                _ => None,
            };
            if let Some(next) = next {
                self.stack.push((branch, next));
                let child = page::branch_child(&buf, next)?;
                return self.descend(child, edge);
            }
        }
        self.leaf = None;
        Ok(false)
    }

    /// Whether the cursor sits on a record.
    pub fn is_valid(&self) -> bool {
        self.current().is_ok()
    }

    /// Record under the cursor.
    pub fn current(&self) -> Result<LeafRecord<'_>> {
        let Some((buf, idx)) = &self.leaf else {
            return Err(StorageError::InvalidPosition("tree cursor is not positioned"));
        };
        if *idx >= page::entry_count(buf)? {
            return Err(StorageError::InvalidPosition("tree cursor is past the end"));
        }
        page::leaf_record(buf, *idx)
    }

    /// Key under the cursor.
    pub fn current_key(&self) -> Result<&[u8]> {
        Ok(self.current()?.key)
    }

    /// Values stored under the current multi-value key, in order.
    pub fn multi_values(&self) -> Result<Vec<Vec<u8>>> {
        let record = self.current()?;
        if record.flags != record_flags::MULTI_VALUE {
            return Err(StorageError::Invalid("record is not a multi-value entry"));
        }
        let nested = Tree::open("", TreeRootHeader::decode(record.value)?);
        collect_keys(&nested, self.pages)
    }
}

/// Every key of `tree` in order.
pub(crate) fn collect_keys(tree: &Tree, pages: &TxPages<'_>) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(tree.number_of_entries() as usize);
    let mut iter = TreeIterator::new(pages, tree.header().root_page);
    let mut more = iter.seek_first()?;
    while more {
        out.push(iter.current_key()?.to_vec());
        more = iter.move_next()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::llt::tests::scratch_pages;

    #[test]
    fn walks_forward_and_backward_across_leaves() {
        let (_dir, source) = scratch_pages(4096);
        let mut pages = TxPages::writable_for_tests(&source, 4096);
        let mut tree = Tree::create("t");
        for n in 0..800u32 {
            tree.add(&mut pages, format!("{n:05}").as_bytes(), &[0u8; 100])
                .unwrap();
        }
        assert!(tree.header().depth >= 2);

        let mut iter = tree.iter(&pages);
        let mut forward = Vec::new();
        let mut more = iter.seek_first().unwrap();
        while more {
            forward.push(iter.current_key().unwrap().to_vec());
            more = iter.move_next().unwrap();
        }
        assert_eq!(forward.len(), 800);
        assert!(forward.windows(2).all(|w| w[0] < w[1]));

        let mut backward = 0;
        let mut more = iter.seek_last().unwrap();
        while more {
            backward += 1;
            more = iter.move_prev().unwrap();
        }
        assert_eq!(backward, 800);
    }

    #[test]
    fn seek_lands_on_next_key() {
        let (_dir, source) = scratch_pages(4096);
        let mut pages = TxPages::writable_for_tests(&source, 4096);
        let mut tree = Tree::create("t");
        for key in [b"b", b"d", b"f"] {
            tree.add(&mut pages, key, b"v").unwrap();
        }
        let mut iter = tree.iter(&pages);
        assert!(iter.seek(b"c").unwrap());
        assert_eq!(iter.current_key().unwrap(), b"d");
        assert!(!iter.seek(b"g").unwrap());
        assert!(matches!(
            iter.current_key(),
            Err(StorageError::InvalidPosition(_))
        ));
    }
}
