//! Root slot of a fixed-size tree: the bytes stored under the tree's name in
//! the root-object tree, or under a key of a variable-size tree.
//!
//! ```text
//! embedded: type u8 | flags u8 | value size u16 | count u16 | pad u16 | entries
//! large:    type u8 | flags u8 | value size u16 | depth u32 | entries i64
//!           | root page i64 | page count i64
//! ```

use crate::primitives::bytes::{read_i64, read_u16, read_u32, read_u8, write_i64, write_u16, write_u32, write_u8};
use crate::types::{PageId, Result, RootObjectType, StorageError};

/// Size of an embedded slot header.
pub const EMBEDDED_HEADER_LEN: usize = 8;
/// Size of a large slot.
pub const LARGE_HEADER_LEN: usize = 32;
/// Bytes of entries an embedded tree holds before it moves to its own pages.
pub const EMBEDDED_BUDGET: usize = 512;

/// Slot flag values.
pub mod slot_flags {
    /// Entries live inside the slot.
    pub const EMBEDDED: u8 = 1;
    /// Entries live in a paged tree.
    pub const LARGE: u8 = 2;
}

/// Root of a paged fixed-size tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LargeRoot {
    /// Root page.
    pub root: PageId,
    /// Levels, a lone leaf being depth 1.
    pub depth: u32,
    /// Number of entries.
    pub entries: u64,
    /// Pages owned by the tree.
    pub page_count: u64,
}

/// Storage shape of a fixed-size tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SlotShape {
    /// No entries and no slot.
    Empty,
    /// Packed `(key, value)` entries, sorted by key.
    Embedded(Vec<u8>),
    /// Paged tree.
    Large(LargeRoot),
}

/// Decoded slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FixedSlot {
    /// `FixedSizeTree` for root objects, `EmbeddedFixedSizeTree` otherwise.
    pub object_type: RootObjectType,
    /// Width of every value.
    pub value_size: u16,
    /// Where the entries live.
    pub shape: SlotShape,
}

impl FixedSlot {
    /// Slot of a tree with no entries.
    pub fn empty(object_type: RootObjectType, value_size: u16) -> Self {
        Self {
            object_type,
            value_size,
            shape: SlotShape::Empty,
        }
    }

    /// Entries an embedded tree with `value_size` values holds.
    pub fn embedded_capacity(value_size: u16) -> usize {
        EMBEDDED_BUDGET / entry_len(value_size)
    }

    /// Number of entries in the tree.
    pub fn number_of_entries(&self) -> u64 {
        match &self.shape {
            SlotShape::Empty => 0,
            SlotShape::Embedded(data) => (data.len() / entry_len(self.value_size)) as u64,
            SlotShape::Large(root) => root.entries,
        }
    }

    /// Decodes a stored slot.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let object_type = RootObjectType::from_u8(read_u8(src, 0)?)?;
        if !matches!(
            object_type,
            RootObjectType::FixedSizeTree | RootObjectType::EmbeddedFixedSizeTree
        ) {
            return Err(StorageError::Corruption("slot is not a fixed-size tree"));
        }
        let value_size = read_u16(src, 2)?;
        let shape = match read_u8(src, 1)? {
            slot_flags::EMBEDDED => {
                let count = read_u16(src, 4)? as usize;
                let len = count * entry_len(value_size);
                let data = src
                    .get(EMBEDDED_HEADER_LEN..EMBEDDED_HEADER_LEN + len)
                    .ok_or(StorageError::Corruption("embedded fixed-size tree truncated"))?;
                SlotShape::Embedded(data.to_vec())
            }
            slot_flags::LARGE => {
                let root = read_i64(src, 16)?;
                if root < 0 {
                    return Err(StorageError::Corruption("large fixed-size tree without root"));
                }
                SlotShape::Large(LargeRoot {
                    root: PageId(root as u64),
                    depth: read_u32(src, 4)?,
                    entries: read_i64(src, 8)?.max(0) as u64,
                    page_count: read_i64(src, 24)?.max(0) as u64,
                })
            }
            _ => return Err(StorageError::Corruption("unknown fixed-size tree slot flags")),
        };
        Ok(Self {
            object_type,
            value_size,
            shape,
        })
    }

    /// Encodes the slot; an empty tree has none.
    pub fn encode(&self) -> Result<Option<Vec<u8>>> {
        let mut out = match &self.shape {
            SlotShape::Empty => return Ok(None),
            SlotShape::Embedded(data) => {
                let mut out = vec![0u8; EMBEDDED_HEADER_LEN + data.len()];
                write_u8(&mut out, 1, slot_flags::EMBEDDED)?;
                write_u16(&mut out, 4, (data.len() / entry_len(self.value_size)) as u16)?;
                out[EMBEDDED_HEADER_LEN..].copy_from_slice(data);
                out
            }
            SlotShape::Large(root) => {
                let mut out = vec![0u8; LARGE_HEADER_LEN];
                write_u8(&mut out, 1, slot_flags::LARGE)?;
                write_u32(&mut out, 4, root.depth)?;
                write_i64(&mut out, 8, root.entries as i64)?;
                write_i64(&mut out, 16, root.root.0 as i64)?;
                write_i64(&mut out, 24, root.page_count as i64)?;
                out
            }
        };
        write_u8(&mut out, 0, self.object_type as u8)?;
        write_u16(&mut out, 2, self.value_size)?;
        Ok(Some(out))
    }
}

/// Bytes one embedded entry takes.
pub fn entry_len(value_size: u16) -> usize {
    8 + value_size as usize
}

/// Key of packed entry `idx`.
pub fn key_at(data: &[u8], value_size: u16, idx: usize) -> Result<i64> {
    read_i64(data, idx * entry_len(value_size))
}

/// Value of packed entry `idx`.
pub fn value_at(data: &[u8], value_size: u16, idx: usize) -> Result<&[u8]> {
    let start = idx * entry_len(value_size) + 8;
    data.get(start..start + value_size as usize)
        .ok_or(StorageError::Corruption("embedded value out of bounds"))
}

/// Binary search over packed entries; see
/// [`FixedPageHeader::search`](super::page::FixedPageHeader::search).
pub fn search(data: &[u8], value_size: u16, key: i64) -> Result<(usize, bool)> {
    let mut low = 0usize;
    let mut high = data.len() / entry_len(value_size);
    while low < high {
        let mid = (low + high) / 2;
        match key_at(data, value_size, mid)?.cmp(&key) {
            std::cmp::Ordering::Equal => return Ok((mid, true)),
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
        }
    }
    Ok((low, false))
}

/// Inserts a packed entry at `idx`.
pub fn insert_at(data: &mut Vec<u8>, value_size: u16, idx: usize, key: i64, value: &[u8]) {
    let at = idx * entry_len(value_size);
    let mut entry = Vec::with_capacity(entry_len(value_size));
    entry.extend_from_slice(&key.to_le_bytes());
    entry.extend_from_slice(value);
    data.splice(at..at, entry);
}

/// Removes packed entry `idx`.
pub fn remove_at(data: &mut Vec<u8>, value_size: u16, idx: usize) {
    let at = idx * entry_len(value_size);
    data.drain(at..at + entry_len(value_size));
}
