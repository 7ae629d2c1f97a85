//! Page layout of large fixed-size trees.
//!
//! ```text
//! 0   page number      u64
//! 8   start position   u16   offset of the first entry
//! 10  entry count      u16
//! 12  page flags       u8    branch / leaf
//! 13  tree flags       u8
//! 14  value size       u16
//! 16  entries          leaf: key i64 + value, branch: key i64 + child u64
//! ```

use crate::primitives::bytes::{read_i64, read_u16, read_u64, read_u8, write_i64, write_u16, write_u64, write_u8};
use crate::types::{PageId, Result, StorageError};

/// Size of the page header.
pub const PAGE_HEADER_LEN: usize = 16;

const BRANCH_ENTRY_LEN: usize = 16;

/// Page flag values.
pub mod page_flags {
    /// Page holds `(key, child)` pairs.
    pub const BRANCH: u8 = 1;
    /// Page holds `(key, value)` pairs.
    pub const LEAF: u8 = 2;
}

/// Tree flag marking a page as belonging to a fixed-size tree.
pub const FIXED_SIZE_TREE_PAGE: u8 = 1;

/// Decoded page header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedPageHeader {
    /// Page number the page was written as.
    pub page_number: u64,
    /// Offset of the first entry.
    pub start_position: u16,
    /// Number of entries.
    pub entries: u16,
    /// Branch or leaf.
    pub flags: u8,
    /// Owning tree kind.
    pub tree_flags: u8,
    /// Value width of the owning tree.
    pub value_size: u16,
}

impl FixedPageHeader {
    /// Header of an empty page.
    pub fn new(page: PageId, flags: u8, value_size: u16) -> Self {
        Self {
            page_number: page.0,
            start_position: PAGE_HEADER_LEN as u16,
            entries: 0,
            flags,
            tree_flags: FIXED_SIZE_TREE_PAGE,
            value_size,
        }
    }

    /// Whether the page is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.flags == page_flags::LEAF
    }

    /// Bytes used by one entry on this page.
    pub fn entry_len(&self) -> usize {
        entry_len(self.is_leaf(), self.value_size)
    }

    /// Decodes the header at the start of `buf`.
    pub fn read(buf: &[u8]) -> Result<Self> {
        let header = Self {
            page_number: read_u64(buf, 0)?,
            start_position: read_u16(buf, 8)?,
            entries: read_u16(buf, 10)?,
            flags: read_u8(buf, 12)?,
            tree_flags: read_u8(buf, 13)?,
            value_size: read_u16(buf, 14)?,
        };
        if header.flags != page_flags::BRANCH && header.flags != page_flags::LEAF {
            return Err(StorageError::Corruption("fixed-size tree page has unknown flags"));
        }
        if (header.start_position as usize) < PAGE_HEADER_LEN
            || header.start_position as usize + header.entries as usize * header.entry_len()
                > buf.len()
        {
            return Err(StorageError::Corruption("fixed-size tree page overflows"));
        }
        Ok(header)
    }

    /// Encodes the header into the start of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        write_u64(buf, 0, self.page_number)?;
        write_u16(buf, 8, self.start_position)?;
        write_u16(buf, 10, self.entries)?;
        write_u8(buf, 12, self.flags)?;
        write_u8(buf, 13, self.tree_flags)?;
        write_u16(buf, 14, self.value_size)
    }

    fn offset(&self, idx: usize) -> usize {
        self.start_position as usize + idx * self.entry_len()
    }

    /// Key of entry `idx`.
    pub fn key(&self, buf: &[u8], idx: usize) -> Result<i64> {
        read_i64(buf, self.offset(idx))
    }

    /// Value of leaf entry `idx`.
    pub fn value<'b>(&self, buf: &'b [u8], idx: usize) -> Result<&'b [u8]> {
        let start = self.offset(idx) + 8;
        buf.get(start..start + self.value_size as usize)
            .ok_or(StorageError::Corruption("fixed-size value out of bounds"))
    }

    /// Child of branch entry `idx`.
    pub fn child(&self, buf: &[u8], idx: usize) -> Result<PageId> {
        Ok(PageId(read_u64(buf, self.offset(idx) + 8)?))
    }

    /// Position of `key`: `(index, true)` on an exact match, otherwise the
    /// index of the first larger key.
    pub fn search(&self, buf: &[u8], key: i64) -> Result<(usize, bool)> {
        let mut low = 0usize;
        let mut high = self.entries as usize;
        while low < high {
            let mid = (low + high) / 2;
            match self.key(buf, mid)?.cmp(&key) {
                std::cmp::Ordering::Equal => return Ok((mid, true)),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        Ok((low, false))
    }

    /// Child index a branch routes `key` to.
    pub fn route(&self, buf: &[u8], key: i64) -> Result<usize> {
        match self.search(buf, key)? {
            (pos, true) => Ok(pos),
            (pos, false) => Ok(pos.saturating_sub(1)),
        }
    }

    /// Opens a gap at `idx` and writes a leaf entry into it.
    pub fn insert_leaf(&mut self, buf: &mut [u8], idx: usize, key: i64, value: &[u8]) -> Result<()> {
        self.open_gap(buf, idx)?;
        let at = self.offset(idx);
        write_i64(buf, at, key)?;
        buf[at + 8..at + 8 + self.value_size as usize].copy_from_slice(value);
        self.write(buf)
    }

    /// Opens a gap at `idx` and writes a branch entry into it.
    pub fn insert_branch(&mut self, buf: &mut [u8], idx: usize, key: i64, child: PageId) -> Result<()> {
        self.open_gap(buf, idx)?;
        let at = self.offset(idx);
        write_i64(buf, at, key)?;
        write_u64(buf, at + 8, child.0)?;
        self.write(buf)
    }

    /// Overwrites the value of leaf entry `idx`.
    pub fn set_value(&self, buf: &mut [u8], idx: usize, value: &[u8]) -> Result<()> {
        let start = self.offset(idx) + 8;
        buf.get_mut(start..start + self.value_size as usize)
            .ok_or(StorageError::Corruption("fixed-size value out of bounds"))?
            .copy_from_slice(value);
        Ok(())
    }

    /// Removes entry `idx`.
    pub fn remove(&mut self, buf: &mut [u8], idx: usize) -> Result<()> {
        let count = self.entries as usize;
        if idx >= count {
            return Err(StorageError::Corruption("fixed-size entry index out of range"));
        }
        let len = self.entry_len();
        buf.copy_within(self.offset(idx + 1)..self.offset(count), self.offset(idx));
        self.entries -= 1;
        let end = self.offset(self.entries as usize);
        buf[end..end + len].fill(0);
        self.write(buf)
    }

    /// Raw bytes of entries `from..` on this page.
    pub fn tail(&self, buf: &[u8], from: usize) -> Vec<u8> {
        buf[self.offset(from)..self.offset(self.entries as usize)].to_vec()
    }

    /// Drops entries `from..` from this page.
    pub fn truncate(&mut self, buf: &mut [u8], from: usize) -> Result<()> {
        let end = self.offset(self.entries as usize);
        buf[self.offset(from)..end].fill(0);
        self.entries = from as u16;
        self.write(buf)
    }

    /// Appends raw entries produced by [`FixedPageHeader::tail`].
    pub fn extend(&mut self, buf: &mut [u8], raw: &[u8]) -> Result<()> {
        let start = self.offset(self.entries as usize);
        buf.get_mut(start..start + raw.len())
            .ok_or(StorageError::Corruption("fixed-size page overflow"))?
            .copy_from_slice(raw);
        self.entries += (raw.len() / self.entry_len()) as u16;
        self.write(buf)
    }

    fn open_gap(&mut self, buf: &mut [u8], idx: usize) -> Result<()> {
        let count = self.entries as usize;
        if idx > count || self.offset(count + 1) > buf.len() {
            return Err(StorageError::Corruption("fixed-size page insert out of range"));
        }
        buf.copy_within(self.offset(idx)..self.offset(count), self.offset(idx + 1));
        self.entries += 1;
        Ok(())
    }
}

/// Bytes used by one entry.
pub fn entry_len(leaf: bool, value_size: u16) -> usize {
    if leaf {
        8 + value_size as usize
    } else {
        BRANCH_ENTRY_LEN
    }
}

/// Entries a page of `page_size` holds.
pub fn capacity(page_size: usize, leaf: bool, value_size: u16) -> usize {
    (page_size - PAGE_HEADER_LEN) / entry_len(leaf, value_size)
}

/// Largest value width a large tree accepts; every leaf holds at least two
/// entries.
pub fn max_value_size(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_LEN) / 2 - 8
}

/// Initializes `buf` as an empty page.
pub fn init(buf: &mut [u8], page: PageId, flags: u8, value_size: u16) -> Result<FixedPageHeader> {
    buf.fill(0);
    let header = FixedPageHeader::new(page, flags, value_size);
    header.write(buf)?;
    Ok(header)
}
