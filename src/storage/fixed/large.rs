//! Paged representation of fixed-size trees.

use crate::storage::fixed::page::{self, page_flags, FixedPageHeader};
use crate::storage::fixed::slot::LargeRoot;
use crate::storage::llt::TxPages;
use crate::storage::tree::TreePath;
use crate::types::{PageId, Result, StorageError};

const MAX_DEPTH: usize = 64;

/// Builds a single-leaf tree holding `raw` packed, sorted entries.
pub(crate) fn create(pages: &mut TxPages<'_>, value_size: u16, raw: &[u8]) -> Result<LargeRoot> {
    let root = pages.allocate()?;
    let buf = pages.modify(root)?;
    let mut header = page::init(buf, root, page_flags::LEAF, value_size)?;
    header.extend(buf, raw)?;
    Ok(LargeRoot {
        root,
        depth: 1,
        entries: u64::from(header.entries),
        page_count: 1,
    })
}

/// Branch path and leaf responsible for `key`.
pub(crate) fn descend(pages: &TxPages<'_>, root: PageId, key: i64) -> Result<(TreePath, PageId)> {
    let mut path = TreePath::new();
    let mut current = root;
    loop {
        let buf = pages.read(current)?;
        let header = FixedPageHeader::read(&buf)?;
        if header.is_leaf() {
            return Ok((path, current));
        }
        let idx = header.route(&buf, key)?;
        path.push((current, idx));
        if path.len() > MAX_DEPTH {
            return Err(StorageError::Corruption("fixed-size tree deeper than supported"));
        }
        current = header.child(&buf, idx)?;
    }
}

pub(crate) fn read(pages: &TxPages<'_>, root: &LargeRoot, key: i64) -> Result<Option<Vec<u8>>> {
    let (_, leaf) = descend(pages, root.root, key)?;
    let buf = pages.read(leaf)?;
    let header = FixedPageHeader::read(&buf)?;
    match header.search(&buf, key)? {
        (pos, true) => Ok(Some(header.value(&buf, pos)?.to_vec())),
        _ => Ok(None),
    }
}

/// Inserts or overwrites `key`. Returns whether a new entry was created.
pub(crate) fn add(
    pages: &mut TxPages<'_>,
    root: &mut LargeRoot,
    value_size: u16,
    key: i64,
    value: &[u8],
) -> Result<bool> {
    let (path, leaf) = descend(pages, root.root, key)?;
    let leaf_capacity = page::capacity(pages.page_size(), true, value_size);
    let (pos, count) = {
        let buf = pages.modify(leaf)?;
        let mut header = FixedPageHeader::read(buf)?;
        let (pos, exact) = header.search(buf, key)?;
        if exact {
            header.set_value(buf, pos, value)?;
            return Ok(false);
        }
        if (header.entries as usize) < leaf_capacity {
            header.insert_leaf(buf, pos, key, value)?;
            root.entries += 1;
            return Ok(true);
        }
        (pos, header.entries as usize)
    };

    let sibling = pages.allocate()?;
    root.page_count += 1;
    root.entries += 1;
    let separator = if pos == count {
        let buf = pages.modify(sibling)?;
        let mut header = page::init(buf, sibling, page_flags::LEAF, value_size)?;
        header.insert_leaf(buf, 0, key, value)?;
        key
    } else {
        let mid = count / 2;
        let upper = {
            let buf = pages.modify(leaf)?;
            let mut header = FixedPageHeader::read(buf)?;
            let upper = header.tail(buf, mid);
            header.truncate(buf, mid)?;
            upper
        };
        let separator = {
            let buf = pages.modify(sibling)?;
            let mut header = page::init(buf, sibling, page_flags::LEAF, value_size)?;
            header.extend(buf, &upper)?;
            header.key(buf, 0)?
        };
        let (target, at) = if key < separator {
            (leaf, pos)
        } else {
            (sibling, pos - mid)
        };
        let buf = pages.modify(target)?;
        let mut header = FixedPageHeader::read(buf)?;
        header.insert_leaf(buf, at, key, value)?;
        separator
    };
    insert_separator(pages, root, path, separator, sibling, value_size)?;
    Ok(true)
}

fn insert_separator(
    pages: &mut TxPages<'_>,
    root: &mut LargeRoot,
    mut path: TreePath,
    mut separator: i64,
    mut right: PageId,
    value_size: u16,
) -> Result<()> {
    let branch_capacity = page::capacity(pages.page_size(), false, value_size);
    loop {
        let Some((parent, idx)) = path.pop() else {
            let left = root.root;
            let left_key = {
                let buf = pages.read(left)?;
                FixedPageHeader::read(&buf)?.key(&buf, 0)?
            };
            let new_root = pages.allocate()?;
            let buf = pages.modify(new_root)?;
            let mut header = page::init(buf, new_root, page_flags::BRANCH, value_size)?;
            header.insert_branch(buf, 0, left_key, left)?;
            header.insert_branch(buf, 1, separator, right)?;
            root.root = new_root;
            root.depth += 1;
            root.page_count += 1;
            return Ok(());
        };
        let pos = idx + 1;
        let count = {
            let buf = pages.modify(parent)?;
            let mut header = FixedPageHeader::read(buf)?;
            if (header.entries as usize) < branch_capacity {
                return header.insert_branch(buf, pos, separator, right);
            }
            header.entries as usize
        };

        let sibling = pages.allocate()?;
        root.page_count += 1;
        let promoted = if pos == count {
            let buf = pages.modify(sibling)?;
            let mut header = page::init(buf, sibling, page_flags::BRANCH, value_size)?;
            header.insert_branch(buf, 0, separator, right)?;
            separator
        } else {
            let mid = count / 2;
            let upper = {
                let buf = pages.modify(parent)?;
                let mut header = FixedPageHeader::read(buf)?;
                let upper = header.tail(buf, mid);
                header.truncate(buf, mid)?;
                upper
            };
            let promoted = {
                let buf = pages.modify(sibling)?;
                let mut header = page::init(buf, sibling, page_flags::BRANCH, value_size)?;
                header.extend(buf, &upper)?;
                header.key(buf, 0)?
            };
            let (target, at) = if pos <= mid {
                (parent, pos)
            } else {
                (sibling, pos - mid)
            };
            let buf = pages.modify(target)?;
            let mut header = FixedPageHeader::read(buf)?;
            header.insert_branch(buf, at, separator, right)?;
            promoted
        };
        separator = promoted;
        right = sibling;
    }
}

/// Removes `key`. Emptied pages are released and a single-child root is
/// collapsed into its child.
pub(crate) fn delete(pages: &mut TxPages<'_>, root: &mut LargeRoot, key: i64) -> Result<bool> {
    let (mut path, leaf) = descend(pages, root.root, key)?;
    let remaining = {
        let buf = pages.modify(leaf)?;
        let mut header = FixedPageHeader::read(buf)?;
        let (pos, exact) = header.search(buf, key)?;
        if !exact {
            return Ok(false);
        }
        header.remove(buf, pos)?;
        header.entries
    };
    root.entries -= 1;
    if remaining > 0 || path.is_empty() {
        return Ok(true);
    }

    pages.free(leaf)?;
    root.page_count -= 1;
    while let Some((parent, idx)) = path.pop() {
        let remaining = {
            let buf = pages.modify(parent)?;
            let mut header = FixedPageHeader::read(buf)?;
            header.remove(buf, idx)?;
            header.entries
        };
        if remaining > 0 {
            break;
        }
        if path.is_empty() {
            let value_size = {
                let buf = pages.read(parent)?;
                FixedPageHeader::read(&buf)?.value_size
            };
            page::init(pages.modify(parent)?, parent, page_flags::LEAF, value_size)?;
            root.depth = 1;
            break;
        }
        pages.free(parent)?;
        root.page_count -= 1;
    }
    collapse_root(pages, root)?;
    Ok(true)
}

fn collapse_root(pages: &mut TxPages<'_>, root: &mut LargeRoot) -> Result<()> {
    loop {
        let child = {
            let buf = pages.read(root.root)?;
            let header = FixedPageHeader::read(&buf)?;
            if header.is_leaf() || header.entries != 1 {
                return Ok(());
            }
            header.child(&buf, 0)?
        };
        pages.free(root.root)?;
        root.root = child;
        root.depth -= 1;
        root.page_count -= 1;
    }
}

/// Keys in `start..=end`, in order. Subtrees entirely outside the range are
/// not read.
pub(crate) fn keys_in_range(
    pages: &TxPages<'_>,
    root: &LargeRoot,
    start: i64,
    end: i64,
) -> Result<Vec<i64>> {
    let mut keys = Vec::new();
    let mut stack = vec![root.root];
    while let Some(page_id) = stack.pop() {
        let buf = pages.read(page_id)?;
        let header = FixedPageHeader::read(&buf)?;
        let count = header.entries as usize;
        if header.is_leaf() {
            for idx in 0..count {
                let key = header.key(&buf, idx)?;
                if key > end {
                    break;
                }
                if key >= start {
                    keys.push(key);
                }
            }
            continue;
        }
        // Child `idx` holds keys below the separator of `idx + 1`.
        for idx in (0..count).rev() {
            if idx > 0 && header.key(&buf, idx)? > end {
                continue;
            }
            if idx + 1 < count && header.key(&buf, idx + 1)? <= start {
                continue;
            }
            stack.push(header.child(&buf, idx)?);
        }
    }
    Ok(keys)
}

/// Every page of the tree.
pub(crate) fn collect_pages(pages: &TxPages<'_>, root: &LargeRoot) -> Result<Vec<PageId>> {
    let mut out = Vec::new();
    let mut stack = vec![root.root];
    while let Some(page_id) = stack.pop() {
        if out.len() as u64 >= root.page_count {
            return Err(StorageError::Corruption(
                "fixed-size tree has more pages than its root records",
            ));
        }
        out.push(page_id);
        let buf = pages.read(page_id)?;
        let header = FixedPageHeader::read(&buf)?;
        if !header.is_leaf() {
            for idx in 0..header.entries as usize {
                stack.push(header.child(&buf, idx)?);
            }
        }
    }
    Ok(out)
}
