//! Fixed-offset layouts of the persisted root metadata.
//!
//! `FileHeader` is stored redundantly in `headers.one` and `headers.two`;
//! `TreeRootHeader` describes a variable-size tree and is embedded both in the
//! file header (root-object tree) and in root-object / multi-value records.

use std::ops::Range;

use serde::Serialize;

use crate::primitives::bytes::{
    read_i32, read_i64, read_page_ref, read_u64, read_u8, write_i32, write_i64, write_page_ref,
    write_u64, write_u8,
};
use crate::types::{PageId, Result, RootObjectType, StorageError, TxId};

/// Marker identifying a valid header file.
pub const MAGIC_MARKER: u64 = 0xB16B_AAD0_C0DE_F00D;

/// On-disk format version understood by this engine.
pub const CURRENT_VERSION: i32 = 1;

/// Names of the two redundant header files, indexed by `revision & 1`.
pub const HEADER_FILE_NAMES: [&str; 2] = ["headers.one", "headers.two"];

/// Encoded size of [`FileHeader`].
pub const FILE_HEADER_LEN: usize = 154;

/// Encoded size of [`TreeRootHeader`].
pub const TREE_ROOT_HEADER_LEN: usize = 62;

const JOURNAL_INFO_LEN: usize = 28;
const INCREMENTAL_BACKUP_INFO_LEN: usize = 24;

const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 8;
const HDR_REVISION: usize = 12;
const HDR_TX_ID: usize = 20;
const HDR_LAST_PAGE: usize = 28;
const HDR_ROOT: Range<usize> = 36..36 + TREE_ROOT_HEADER_LEN;
const HDR_JOURNAL: Range<usize> = 98..98 + JOURNAL_INFO_LEN;
const HDR_INCREMENTAL_BACKUP: Range<usize> = 126..126 + INCREMENTAL_BACKUP_INFO_LEN;
const HDR_PAGE_SIZE: usize = 150;

const ROOT_TYPE: usize = 0;
const ROOT_FLAGS: usize = 1;
const ROOT_PAGE: usize = 2;
const ROOT_BRANCH_PAGES: usize = 10;
const ROOT_LEAF_PAGES: usize = 18;
const ROOT_OVERFLOW_PAGES: usize = 26;
const ROOT_PAGE_COUNT: usize = 34;
const ROOT_ENTRIES: usize = 42;
const ROOT_DEPTH: usize = 50;

const JOURNAL_CURRENT: usize = 0;
const JOURNAL_FILES_COUNT: usize = 8;
const JOURNAL_LAST_SYNCED: usize = 12;
const JOURNAL_LAST_SYNCED_TX: usize = 20;

const BACKUP_LAST_JOURNAL: usize = 0;
const BACKUP_LAST_JOURNAL_PAGE: usize = 8;
const BACKUP_LAST_CREATED_JOURNAL: usize = 16;

/// Flags stored in a tree root header.
pub mod tree_flags {
    /// No special behavior.
    pub const NONE: u8 = 0;
    /// The tree is a nested multi-value tree (values are stored as keys).
    pub const MULTI_VALUE: u8 = 1;
    /// The tree owns at least one nested multi-value tree.
    pub const MULTI_VALUE_TREES: u8 = 2;
}

/// Root state of a variable-size tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct TreeRootHeader {
    /// Object type tag, always `VariableSizeTree` for trees.
    #[serde(skip)]
    pub root_object_type: RootObjectType,
    /// Combination of [`tree_flags`] bits.
    pub flags: u8,
    /// Root page, `None` for a tree that has not been materialized.
    #[serde(serialize_with = "serialize_page")]
    pub root_page: Option<PageId>,
    /// Number of branch pages owned by the tree.
    pub branch_pages: u64,
    /// Number of leaf pages owned by the tree.
    pub leaf_pages: u64,
    /// Number of overflow pages owned by the tree.
    pub overflow_pages: u64,
    /// Total number of pages owned by the tree.
    pub page_count: u64,
    /// Number of entries stored in the tree.
    pub number_of_entries: u64,
    /// Height of the tree (1 for a single leaf).
    pub depth: i32,
}

fn serialize_page<S: serde::Serializer>(
    page: &Option<PageId>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match page {
        Some(page) => serializer.serialize_i64(page.0 as i64),
        None => serializer.serialize_i64(-1),
    }
}

impl TreeRootHeader {
    /// Header of a tree with no pages.
    pub fn empty() -> Self {
        Self {
            root_object_type: RootObjectType::VariableSizeTree,
            flags: tree_flags::NONE,
            root_page: None,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            page_count: 0,
            number_of_entries: 0,
            depth: 0,
        }
    }

    /// Encodes the header into a fixed-size buffer.
    pub fn encode(&self) -> [u8; TREE_ROOT_HEADER_LEN] {
        let mut buf = [0u8; TREE_ROOT_HEADER_LEN];
        self.encode_into(&mut buf)
            .map(|_| buf)
            .unwrap_or([0u8; TREE_ROOT_HEADER_LEN])
    }

    /// Encodes the header into `dst`, which must hold at least
    /// [`TREE_ROOT_HEADER_LEN`] bytes.
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < TREE_ROOT_HEADER_LEN {
            return Err(StorageError::Invalid("tree root header buffer too small"));
        }
        dst[..TREE_ROOT_HEADER_LEN].fill(0);
        write_u8(dst, ROOT_TYPE, self.root_object_type as u8)?;
        write_u8(dst, ROOT_FLAGS, self.flags)?;
        write_page_ref(dst, ROOT_PAGE, self.root_page.map(|p| p.0))?;
        write_i64(dst, ROOT_BRANCH_PAGES, self.branch_pages as i64)?;
        write_i64(dst, ROOT_LEAF_PAGES, self.leaf_pages as i64)?;
        write_i64(dst, ROOT_OVERFLOW_PAGES, self.overflow_pages as i64)?;
        write_i64(dst, ROOT_PAGE_COUNT, self.page_count as i64)?;
        write_i64(dst, ROOT_ENTRIES, self.number_of_entries as i64)?;
        write_i32(dst, ROOT_DEPTH, self.depth)?;
        Ok(())
    }

    /// Decodes a header previously written by [`TreeRootHeader::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TREE_ROOT_HEADER_LEN {
            return Err(StorageError::Corruption("tree root header truncated"));
        }
        let root_object_type = RootObjectType::from_u8(read_u8(src, ROOT_TYPE)?)?;
        if root_object_type != RootObjectType::VariableSizeTree {
            return Err(StorageError::Corruption(
                "tree root header has wrong object type",
            ));
        }
        let counter = |off: usize| -> Result<u64> {
            let raw = read_i64(src, off)?;
            u64::try_from(raw).map_err(|_| StorageError::Corruption("negative tree counter"))
        };
        Ok(Self {
            root_object_type,
            flags: read_u8(src, ROOT_FLAGS)?,
            root_page: read_page_ref(src, ROOT_PAGE)?.map(PageId),
            branch_pages: counter(ROOT_BRANCH_PAGES)?,
            leaf_pages: counter(ROOT_LEAF_PAGES)?,
            overflow_pages: counter(ROOT_OVERFLOW_PAGES)?,
            page_count: counter(ROOT_PAGE_COUNT)?,
            number_of_entries: counter(ROOT_ENTRIES)?,
            depth: read_i32(src, ROOT_DEPTH)?,
        })
    }
}

/// Journal bookkeeping persisted in the file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct JournalInfo {
    /// Number of the journal currently receiving writes, `-1` if none.
    pub current_journal: i64,
    /// Number of journal files still on disk.
    pub journal_files_count: i32,
    /// Journal holding the last transaction applied to the data file.
    pub last_synced_journal: i64,
    /// Last transaction applied to the data file.
    pub last_synced_transaction_id: i64,
}

impl JournalInfo {
    fn none() -> Self {
        Self {
            current_journal: -1,
            journal_files_count: 0,
            last_synced_journal: -1,
            last_synced_transaction_id: -1,
        }
    }
}

/// Incremental backup bookkeeping persisted in the file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct IncrementalBackupInfo {
    /// Last journal fully included in an incremental backup.
    pub last_backed_up_journal: i64,
    /// Last page of `last_backed_up_journal` included in a backup.
    pub last_backed_up_journal_page: i64,
    /// Newest journal retained for incremental backup.
    pub last_created_journal: i64,
}

impl IncrementalBackupInfo {
    fn none() -> Self {
        Self {
            last_backed_up_journal: -1,
            last_backed_up_journal_page: -1,
            last_created_journal: -1,
        }
    }
}

/// Root metadata of a store, persisted in two alternating files.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FileHeader {
    /// Must equal [`MAGIC_MARKER`] for the header to be valid.
    pub magic_marker: u64,
    /// Format version the store was written with.
    pub version: i32,
    /// Incremented on every persisted modification.
    pub header_revision: i64,
    /// Last transaction applied to the data file.
    pub transaction_id: i64,
    /// Highest allocated page number, `-1` for an empty data file.
    pub last_page_number: i64,
    /// Root state of the root-object tree.
    pub root: TreeRootHeader,
    /// Journal bookkeeping.
    pub journal: JournalInfo,
    /// Incremental backup bookkeeping.
    pub incremental_backup: IncrementalBackupInfo,
    /// Page size of the data file.
    pub page_size: i32,
}

impl FileHeader {
    /// Header of a freshly created store.
    pub fn fresh(page_size: u32) -> Self {
        Self {
            magic_marker: MAGIC_MARKER,
            version: CURRENT_VERSION,
            header_revision: -1,
            transaction_id: 0,
            last_page_number: -1,
            root: TreeRootHeader::empty(),
            journal: JournalInfo::none(),
            incremental_backup: IncrementalBackupInfo::none(),
            page_size: page_size as i32,
        }
    }

    /// Returns whether the magic marker matches.
    pub fn has_valid_marker(&self) -> bool {
        self.magic_marker == MAGIC_MARKER
    }

    /// Last applied transaction as a typed id.
    pub fn last_transaction(&self) -> Result<TxId> {
        u64::try_from(self.transaction_id)
            .map(TxId)
            .map_err(|_| StorageError::Corruption("negative transaction id"))
    }

    /// Number of pages implied by `last_page_number`.
    pub fn allocated_pages(&self) -> u64 {
        (self.last_page_number + 1).max(0) as u64
    }

    /// Encodes the header at its fixed offsets.
    pub fn encode(&self) -> Result<[u8; FILE_HEADER_LEN]> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        write_u64(&mut buf, HDR_MAGIC, self.magic_marker)?;
        write_i32(&mut buf, HDR_VERSION, self.version)?;
        write_i64(&mut buf, HDR_REVISION, self.header_revision)?;
        write_i64(&mut buf, HDR_TX_ID, self.transaction_id)?;
        write_i64(&mut buf, HDR_LAST_PAGE, self.last_page_number)?;
        self.root.encode_into(&mut buf[HDR_ROOT])?;

        let journal = &mut buf[HDR_JOURNAL];
        write_i64(journal, JOURNAL_CURRENT, self.journal.current_journal)?;
        write_i32(journal, JOURNAL_FILES_COUNT, self.journal.journal_files_count)?;
        write_i64(journal, JOURNAL_LAST_SYNCED, self.journal.last_synced_journal)?;
        write_i64(
            journal,
            JOURNAL_LAST_SYNCED_TX,
            self.journal.last_synced_transaction_id,
        )?;

        let backup = &mut buf[HDR_INCREMENTAL_BACKUP];
        write_i64(
            backup,
            BACKUP_LAST_JOURNAL,
            self.incremental_backup.last_backed_up_journal,
        )?;
        write_i64(
            backup,
            BACKUP_LAST_JOURNAL_PAGE,
            self.incremental_backup.last_backed_up_journal_page,
        )?;
        write_i64(
            backup,
            BACKUP_LAST_CREATED_JOURNAL,
            self.incremental_backup.last_created_journal,
        )?;

        write_i32(&mut buf, HDR_PAGE_SIZE, self.page_size)?;
        Ok(buf)
    }

    /// Decodes a header without validating the marker or version; callers
    /// arbitrate validity (see `HeaderAccessor`).
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(StorageError::Corruption("file header truncated"));
        }
        let journal = &src[HDR_JOURNAL];
        let backup = &src[HDR_INCREMENTAL_BACKUP];
        let magic_marker = read_u64(src, HDR_MAGIC)?;
        // A header with a bad marker is reported as invalid, not as a decode
        // failure, so only decode the root when the marker matches.
        let root = if magic_marker == MAGIC_MARKER {
            TreeRootHeader::decode(&src[HDR_ROOT])?
        } else {
            TreeRootHeader::empty()
        };
        Ok(Self {
            magic_marker,
            version: read_i32(src, HDR_VERSION)?,
            header_revision: read_i64(src, HDR_REVISION)?,
            transaction_id: read_i64(src, HDR_TX_ID)?,
            last_page_number: read_i64(src, HDR_LAST_PAGE)?,
            root,
            journal: JournalInfo {
                current_journal: read_i64(journal, JOURNAL_CURRENT)?,
                journal_files_count: read_i32(journal, JOURNAL_FILES_COUNT)?,
                last_synced_journal: read_i64(journal, JOURNAL_LAST_SYNCED)?,
                last_synced_transaction_id: read_i64(journal, JOURNAL_LAST_SYNCED_TX)?,
            },
            incremental_backup: IncrementalBackupInfo {
                last_backed_up_journal: read_i64(backup, BACKUP_LAST_JOURNAL)?,
                last_backed_up_journal_page: read_i64(backup, BACKUP_LAST_JOURNAL_PAGE)?,
                last_created_journal: read_i64(backup, BACKUP_LAST_CREATED_JOURNAL)?,
            },
            page_size: read_i32(src, HDR_PAGE_SIZE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_land_at_documented_offsets() {
        let mut header = FileHeader::fresh(8192);
        header.header_revision = 0x0102;
        header.transaction_id = 77;
        header.last_page_number = 12;
        header.journal.current_journal = 3;
        header.incremental_backup.last_created_journal = 5;
        let buf = header.encode().unwrap();

        assert_eq!(read_u64(&buf, 0).unwrap(), MAGIC_MARKER);
        assert_eq!(read_i32(&buf, 8).unwrap(), CURRENT_VERSION);
        assert_eq!(read_i64(&buf, 12).unwrap(), 0x0102);
        assert_eq!(read_i64(&buf, 20).unwrap(), 77);
        assert_eq!(read_i64(&buf, 28).unwrap(), 12);
        assert_eq!(buf[36], RootObjectType::VariableSizeTree as u8);
        assert_eq!(read_i64(&buf, 98).unwrap(), 3);
        assert_eq!(read_i64(&buf, 126 + 16).unwrap(), 5);
        assert_eq!(read_i32(&buf, 150).unwrap(), 8192);
        assert!(FILE_HEADER_LEN <= 158);
    }

    #[test]
    fn header_roundtrip_preserves_root() {
        let mut header = FileHeader::fresh(4096);
        header.root.root_page = Some(PageId(4));
        header.root.depth = 2;
        header.root.number_of_entries = 9;
        let decoded = FileHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn negative_transaction_id_is_corruption() {
        let mut header = FileHeader::fresh(4096);
        header.transaction_id = -3;
        assert!(matches!(
            header.last_transaction(),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn tree_root_header_rejects_foreign_type() {
        let mut buf = TreeRootHeader::empty().encode();
        buf[0] = RootObjectType::FixedSizeTree as u8;
        assert!(TreeRootHeader::decode(&buf).is_err());
    }
}
