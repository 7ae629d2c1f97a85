//! Slotted page layout of the variable-size tree.
//!
//! ```text
//! 0        8      9    10         12      14      16
//! | page # | kind | -- | entries  | lower | upper | slot[0] slot[1] ... -> free <- records |
//! ```
//!
//! Slots are little-endian `u16` record offsets kept in key order. Leaf
//! records are `flags:u8 key_len:u16 val_len:u16 key val`; branch records are
//! `child:u64 key_len:u16 key`. The key of branch slot 0 is never consulted:
//! it stands for "everything below slot 1".

use crate::primitives::bytes::{read_u16, read_u64, read_u8, write_u16, write_u64, write_u8};
use crate::types::{PageId, Result, StorageError};

/// Bytes occupied by the page header.
pub const PAGE_HEADER_LEN: usize = 16;
const SLOT_LEN: usize = 2;
const LEAF_RECORD_HEADER_LEN: usize = 5;
const BRANCH_RECORD_HEADER_LEN: usize = 10;

const PH_PAGE_NUMBER: usize = 0;
const PH_KIND: usize = 8;
const PH_ENTRIES: usize = 10;
const PH_LOWER: usize = 12;
const PH_UPPER: usize = 14;

/// Kind of a tree page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Page of `(key, child)` separators.
    Branch = 1,
    /// Page of `(flags, key, value)` records.
    Leaf = 2,
}

impl NodeKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Branch),
            2 => Ok(Self::Leaf),
            _ => Err(StorageError::Corruption("unknown tree page kind")),
        }
    }
}

/// Owned leaf record used while rewriting a page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafEntry {
    /// Record flags (see `record_flags`).
    pub flags: u8,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
}

impl LeafEntry {
    fn encoded_len(&self) -> usize {
        SLOT_LEN + LEAF_RECORD_HEADER_LEN + self.key.len() + self.value.len()
    }
}

/// Owned branch record used while rewriting a page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BranchEntry {
    /// Separator key; empty for slot 0.
    pub key: Vec<u8>,
    /// Child page.
    pub child: PageId,
}

impl BranchEntry {
    fn encoded_len(&self) -> usize {
        SLOT_LEN + BRANCH_RECORD_HEADER_LEN + self.key.len()
    }
}

/// Borrowed view of one leaf record.
#[derive(Clone, Copy, Debug)]
pub struct LeafRecord<'a> {
    /// Record flags.
    pub flags: u8,
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes.
    pub value: &'a [u8],
}

/// Size a single leaf record takes on a page, slot included.
pub fn leaf_record_len(key_len: usize, value_len: usize) -> usize {
    SLOT_LEN + LEAF_RECORD_HEADER_LEN + key_len + value_len
}

/// Formats `buf` as an empty page.
pub fn init(buf: &mut [u8], page: PageId, kind: NodeKind) -> Result<()> {
    let upper = u16::try_from(buf.len()).map_err(|_| StorageError::Invalid("page too large"))?;
    buf.fill(0);
    write_u64(buf, PH_PAGE_NUMBER, page.0)?;
    write_u8(buf, PH_KIND, kind as u8)?;
    write_u16(buf, PH_ENTRIES, 0)?;
    write_u16(buf, PH_LOWER, PAGE_HEADER_LEN as u16)?;
    write_u16(buf, PH_UPPER, upper)?;
    Ok(())
}

/// Kind of the page in `buf`.
pub fn kind(buf: &[u8]) -> Result<NodeKind> {
    NodeKind::from_u8(read_u8(buf, PH_KIND)?)
}

/// Number of records on the page.
pub fn entry_count(buf: &[u8]) -> Result<usize> {
    Ok(read_u16(buf, PH_ENTRIES)? as usize)
}

fn record_offset(buf: &[u8], idx: usize) -> Result<usize> {
    if idx >= entry_count(buf)? {
        return Err(StorageError::Corruption("slot index out of range"));
    }
    let off = read_u16(buf, PAGE_HEADER_LEN + idx * SLOT_LEN)? as usize;
    if off < PAGE_HEADER_LEN || off >= buf.len() {
        return Err(StorageError::Corruption("record offset out of range"));
    }
    Ok(off)
}

fn bytes_at(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    buf.get(off..off + len)
        .ok_or(StorageError::Corruption("record extends past page"))
}

/// Leaf record at slot `idx`.
pub fn leaf_record(buf: &[u8], idx: usize) -> Result<LeafRecord<'_>> {
    let off = record_offset(buf, idx)?;
    let flags = read_u8(buf, off)?;
    let key_len = read_u16(buf, off + 1)? as usize;
    let value_len = read_u16(buf, off + 3)? as usize;
    let key_off = off + LEAF_RECORD_HEADER_LEN;
    Ok(LeafRecord {
        flags,
        key: bytes_at(buf, key_off, key_len)?,
        value: bytes_at(buf, key_off + key_len, value_len)?,
    })
}

/// Branch separator at slot `idx`.
pub fn branch_key(buf: &[u8], idx: usize) -> Result<&[u8]> {
    let off = record_offset(buf, idx)?;
    let key_len = read_u16(buf, off + 8)? as usize;
    bytes_at(buf, off + BRANCH_RECORD_HEADER_LEN, key_len)
}

/// Child page at branch slot `idx`.
pub fn branch_child(buf: &[u8], idx: usize) -> Result<PageId> {
    let off = record_offset(buf, idx)?;
    Ok(PageId(read_u64(buf, off)?))
}

/// Position of `key` in a leaf: the index of the first record whose key is
/// `>= key`, and whether that record matches exactly.
pub fn search_leaf(buf: &[u8], key: &[u8]) -> Result<(usize, bool)> {
    let mut low = 0usize;
    let mut high = entry_count(buf)?;
    while low < high {
        let mid = (low + high) / 2;
        match leaf_record(buf, mid)?.key.cmp(key) {
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
            std::cmp::Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((low, false))
}

/// Child slot to descend into for `key`: the last slot whose separator is
/// `<= key`, slot 0 covering everything smaller.
pub fn search_branch(buf: &[u8], key: &[u8]) -> Result<usize> {
    let count = entry_count(buf)?;
    if count == 0 {
        return Err(StorageError::Corruption("empty branch page"));
    }
    let mut low = 1usize;
    let mut high = count;
    while low < high {
        let mid = (low + high) / 2;
        if branch_key(buf, mid)? <= key {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    Ok(low - 1)
}

/// Decodes every leaf record.
pub fn decode_leaf(buf: &[u8]) -> Result<Vec<LeafEntry>> {
    (0..entry_count(buf)?)
        .map(|idx| {
            let record = leaf_record(buf, idx)?;
            Ok(LeafEntry {
                flags: record.flags,
                key: record.key.to_vec(),
                value: record.value.to_vec(),
            })
        })
        .collect()
}

/// Decodes every branch record.
pub fn decode_branch(buf: &[u8]) -> Result<Vec<BranchEntry>> {
    (0..entry_count(buf)?)
        .map(|idx| {
            Ok(BranchEntry {
                key: branch_key(buf, idx)?.to_vec(),
                child: branch_child(buf, idx)?,
            })
        })
        .collect()
}

/// Whether `entries` fit on a leaf page of `page_size` bytes.
pub fn leaf_fits(page_size: usize, entries: &[LeafEntry]) -> bool {
    PAGE_HEADER_LEN + entries.iter().map(LeafEntry::encoded_len).sum::<usize>() <= page_size
}

/// Whether `entries` fit on a branch page of `page_size` bytes.
pub fn branch_fits(page_size: usize, entries: &[BranchEntry]) -> bool {
    PAGE_HEADER_LEN + entries.iter().map(BranchEntry::encoded_len).sum::<usize>() <= page_size
}

/// Index at which to cut `entries` so both halves carry about the same
/// number of bytes. Always leaves at least one entry on each side.
pub fn split_point<T>(entries: &[T], len_of: impl Fn(&T) -> usize) -> usize {
    let total: usize = entries.iter().map(&len_of).sum();
    let mut acc = 0usize;
    for (idx, entry) in entries.iter().enumerate() {
        acc += len_of(entry);
        if acc * 2 >= total {
            return (idx + 1).clamp(1, entries.len().saturating_sub(1).max(1));
        }
    }
    entries.len() / 2
}

/// Byte length of a leaf entry, for [`split_point`].
pub fn leaf_entry_len(entry: &LeafEntry) -> usize {
    entry.encoded_len()
}

/// Byte length of a branch entry, for [`split_point`].
pub fn branch_entry_len(entry: &BranchEntry) -> usize {
    entry.encoded_len()
}

/// Rewrites `buf` as a leaf holding `entries` in order.
pub fn write_leaf(buf: &mut [u8], page: PageId, entries: &[LeafEntry]) -> Result<()> {
    if !leaf_fits(buf.len(), entries) {
        return Err(StorageError::Invalid("leaf entries exceed page"));
    }
    init(buf, page, NodeKind::Leaf)?;
    let mut upper = buf.len();
    for (idx, entry) in entries.iter().enumerate() {
        let len = LEAF_RECORD_HEADER_LEN + entry.key.len() + entry.value.len();
        upper -= len;
        write_u8(buf, upper, entry.flags)?;
        write_u16(buf, upper + 1, entry.key.len() as u16)?;
        write_u16(buf, upper + 3, entry.value.len() as u16)?;
        let key_off = upper + LEAF_RECORD_HEADER_LEN;
        buf[key_off..key_off + entry.key.len()].copy_from_slice(&entry.key);
        let val_off = key_off + entry.key.len();
        buf[val_off..val_off + entry.value.len()].copy_from_slice(&entry.value);
        write_u16(buf, PAGE_HEADER_LEN + idx * SLOT_LEN, upper as u16)?;
    }
    finish(buf, entries.len(), upper)
}

/// Rewrites `buf` as a branch holding `entries` in order.
pub fn write_branch(buf: &mut [u8], page: PageId, entries: &[BranchEntry]) -> Result<()> {
    if !branch_fits(buf.len(), entries) {
        return Err(StorageError::Invalid("branch entries exceed page"));
    }
    init(buf, page, NodeKind::Branch)?;
    let mut upper = buf.len();
    for (idx, entry) in entries.iter().enumerate() {
        // Slot 0's separator is implicit and not stored.
        let key: &[u8] = if idx == 0 { &[] } else { &entry.key };
        upper -= BRANCH_RECORD_HEADER_LEN + key.len();
        write_u64(buf, upper, entry.child.0)?;
        write_u16(buf, upper + 8, key.len() as u16)?;
        let key_off = upper + BRANCH_RECORD_HEADER_LEN;
        buf[key_off..key_off + key.len()].copy_from_slice(key);
        write_u16(buf, PAGE_HEADER_LEN + idx * SLOT_LEN, upper as u16)?;
    }
    finish(buf, entries.len(), upper)
}

fn finish(buf: &mut [u8], count: usize, upper: usize) -> Result<()> {
    write_u16(buf, PH_ENTRIES, count as u16)?;
    write_u16(buf, PH_LOWER, (PAGE_HEADER_LEN + count * SLOT_LEN) as u16)?;
    write_u16(buf, PH_UPPER, upper as u16)
}
