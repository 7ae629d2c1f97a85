#![forbid(unsafe_code)]
//! Write-ahead journal: one page-aligned record per committed write
//! transaction, spread over numbered files that are rolled once they reach the
//! configured maximum size.

use std::fs;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::bytes::{read_i64, read_u32, read_u64, write_i64, write_u32, write_u64};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::PageImage;
use crate::storage::header::TREE_ROOT_HEADER_LEN;
use crate::types::checksum::record_crc32;
use crate::types::{journal_name, PageId, Result, StorageError, TxId, JOURNAL_EXTENSION};

const RECORD_MARKER: u64 = 0x4A52_4E4C_5245_4331;
const REC_MARKER: usize = 0;
const REC_TX_ID: usize = 8;
const REC_LAST_PAGE: usize = 16;
const REC_PAGE_COUNT: usize = 24;
const REC_CRC: usize = 28;
const REC_ROOT: usize = 32;
const REC_PAGE_NUMBERS: usize = 96;

/// Sizing and durability settings of a journal directory.
#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// Directory holding the journal files.
    pub dir: PathBuf,
    /// Page size; records are aligned to it.
    pub page_size: usize,
    /// Size a fresh journal file is preallocated to.
    pub initial_file_size: u64,
    /// Size after which the next record goes to a new file.
    pub max_file_size: u64,
    /// Whether every append is followed by an fsync.
    pub sync: bool,
    /// Keep retired files on disk (incremental backup).
    pub keep_retired: bool,
}

/// A committed transaction as written to, or read back from, the journal.
pub struct JournalRecord<'a> {
    /// Committing transaction.
    pub tx_id: TxId,
    /// Highest allocated page after the transaction.
    pub last_page_number: i64,
    /// Encoded root-object tree header after the transaction.
    pub root_state: &'a [u8],
    /// Modified page images.
    pub pages: &'a [(PageId, PageImage)],
}

/// A record recovered from disk.
#[derive(Debug)]
pub struct RecoveredTransaction {
    /// Journal file the record was read from.
    pub journal: u64,
    /// Committed transaction.
    pub tx_id: TxId,
    /// Highest allocated page after the transaction.
    pub last_page_number: i64,
    /// Encoded root-object tree header after the transaction.
    pub root_state: Vec<u8>,
    /// Modified page images.
    pub pages: Vec<(PageId, PageImage)>,
}

/// Outcome of replaying the journal directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryReport {
    /// Records handed to the apply callback.
    pub applied: usize,
    /// Records skipped because the data file already contains them.
    pub skipped: usize,
    /// Last transaction seen in the journals.
    pub last_tx: Option<TxId>,
    /// Whether replay stopped at a torn or invalid record.
    pub torn: bool,
}

#[derive(Debug, Default)]
struct FileState {
    write_page_position: u64,
    allocated_pages: u64,
    last_tx: Option<TxId>,
}

/// One numbered journal file.
///
/// The journal itself holds one reference; backups take extra ones through
/// [`JournalFile::add_ref`]. A retired file is deleted once the last reference
/// is released.
pub struct JournalFile {
    number: u64,
    path: PathBuf,
    io: StdFileIo,
    page_size: usize,
    state: Mutex<FileState>,
    refs: AtomicUsize,
    retired: AtomicBool,
    keep_on_retire: bool,
}

impl std::fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFile")
            .field("number", &self.number)
            .field("refs", &self.refs.load(Ordering::Acquire))
            .field("retired", &self.retired.load(Ordering::Acquire))
            .finish()
    }
}

impl JournalFile {
    fn open(number: u64, path: PathBuf, options: &JournalOptions) -> Result<Self> {
        let io = StdFileIo::open(&path)?;
        let allocated_pages = io.len()? / options.page_size as u64;
        Ok(Self {
            number,
            path,
            io,
            page_size: options.page_size,
            state: Mutex::new(FileState {
                allocated_pages,
                ..FileState::default()
            }),
            refs: AtomicUsize::new(1),
            retired: AtomicBool::new(false),
            keep_on_retire: options.keep_retired,
        })
    }

    /// Journal number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Path of the file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pages holding complete records.
    pub fn write_page_position(&self) -> u64 {
        self.state.lock().write_page_position
    }

    /// Last transaction written to this file.
    pub fn last_transaction(&self) -> Option<TxId> {
        self.state.lock().last_tx
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Takes a reference that keeps the file on disk until dropped.
    pub fn add_ref(self: &Arc<Self>) -> JournalRef {
        self.refs.fetch_add(1, Ordering::AcqRel);
        JournalRef(Arc::clone(self))
    }

    /// Drops one reference, deleting the file if it was retired and this was
    /// the last one.
    pub fn release(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.retired.load(Ordering::Acquire) && !self.keep_on_retire {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(journal = self.number, "journal.file.deleted"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(journal = self.number, error = %err, "journal.file.delete_failed"),
            }
        }
    }

    fn retire(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }

    /// Streams the first `pages` pages of the file into `out`.
    pub fn copy_pages_to(&self, pages: u64, out: &mut dyn Write) -> Result<u64> {
        let len = (pages * self.page_size as u64).min(self.io.len()?);
        self.io.copy_prefix_to(len, out)
    }

    fn append(&self, buf: &[u8], pages: u64, tx: TxId, options: &JournalOptions) -> Result<()> {
        let mut state = self.state.lock();
        let end = state.write_page_position + pages;
        if end > state.allocated_pages {
            let max_pages = (options.max_file_size / self.page_size as u64).max(1);
            let grown = (state.allocated_pages * 2).min(max_pages).max(end);
            self.io.truncate(grown * self.page_size as u64)?;
            state.allocated_pages = grown;
        }
        self.io
            .write_at(state.write_page_position * self.page_size as u64, buf)?;
        if options.sync {
            self.io.sync_all()?;
        }
        state.write_page_position = end;
        state.last_tx = Some(tx);
        Ok(())
    }
}

/// Reference to a journal file released on drop.
#[derive(Debug)]
pub struct JournalRef(Arc<JournalFile>);

impl Deref for JournalRef {
    type Target = JournalFile;

    fn deref(&self) -> &JournalFile {
        &self.0
    }
}

impl Drop for JournalRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Journal file pinned together with the number of pages valid at pin time.
#[derive(Debug)]
pub struct JournalSnapshot {
    /// Pinned file.
    pub file: JournalRef,
    /// Pages holding complete records when the snapshot was taken.
    pub pages: u64,
}

struct JournalSet {
    active: Vec<Arc<JournalFile>>,
    current: Option<Arc<JournalFile>>,
    next_number: u64,
}

/// Numbered sequence of journal files.
pub struct Journal {
    options: JournalOptions,
    set: Mutex<JournalSet>,
}

impl Journal {
    /// Opens the journal directory, picking up any files left by a previous
    /// run. New files are numbered after both the existing files and
    /// `min_next_number`.
    pub fn open(options: JournalOptions, min_next_number: u64) -> Result<Self> {
        if options.page_size == 0 {
            return Err(StorageError::Invalid("journal page size must be non-zero"));
        }
        fs::create_dir_all(&options.dir)?;
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&options.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            if let Some(number) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        let mut active = Vec::with_capacity(numbers.len());
        for number in &numbers {
            let path = options.dir.join(journal_name(*number));
            active.push(Arc::new(JournalFile::open(*number, path, &options)?));
        }
        let next_number = numbers
            .last()
            .map(|n| n + 1)
            .unwrap_or(0)
            .max(min_next_number);
        Ok(Self {
            options,
            set: Mutex::new(JournalSet {
                active,
                current: None,
                next_number,
            }),
        })
    }

    /// Settings the journal was opened with.
    pub fn options(&self) -> &JournalOptions {
        &self.options
    }

    /// Replays every record newer than `after`, in file and record order,
    /// stopping at the first torn or invalid record.
    pub fn recover(
        &self,
        after: TxId,
        mut apply: impl FnMut(RecoveredTransaction) -> Result<()>,
    ) -> Result<RecoveryReport> {
        let files: Vec<Arc<JournalFile>> = self.set.lock().active.clone();
        let mut report = RecoveryReport::default();
        'files: for file in files {
            let file_pages = file.io.len()? / self.options.page_size as u64;
            let mut position = 0u64;
            while position < file_pages {
                match self.read_record(&file, position, file_pages)? {
                    ReadOutcome::End => break,
                    ReadOutcome::Torn => {
                        warn!(
                            journal = file.number,
                            page = position,
                            "journal.recover.torn_record"
                        );
                        report.torn = true;
                        file.state.lock().write_page_position = position;
                        break 'files;
                    }
                    ReadOutcome::Record(record, pages) => {
                        if report.last_tx.is_some_and(|last| record.tx_id <= last) {
                            report.torn = true;
                            file.state.lock().write_page_position = position;
                            break 'files;
                        }
                        position += pages;
                        report.last_tx = Some(record.tx_id);
                        {
                            let mut state = file.state.lock();
                            state.write_page_position = position;
                            state.last_tx = Some(record.tx_id);
                        }
                        if record.tx_id > after {
                            apply(record)?;
                            report.applied += 1;
                        } else {
                            report.skipped += 1;
                        }
                    }
                }
            }
        }
        info!(
            applied = report.applied,
            skipped = report.skipped,
            torn = report.torn,
            "journal.recover.completed"
        );
        Ok(report)
    }

    fn read_record(
        &self,
        file: &JournalFile,
        position: u64,
        file_pages: u64,
    ) -> Result<ReadOutcome> {
        let page_size = self.options.page_size;
        let mut first = vec![0u8; page_size];
        file.io.read_at(position * page_size as u64, &mut first)?;
        if read_u64(&first, REC_MARKER)? != RECORD_MARKER {
            return Ok(ReadOutcome::End);
        }
        let tx_id = read_i64(&first, REC_TX_ID)?;
        let page_count = read_u32(&first, REC_PAGE_COUNT)? as u64;
        let header_pages = header_pages(page_count as usize, page_size) as u64;
        if tx_id < 0 || position + header_pages + page_count > file_pages {
            return Ok(ReadOutcome::Torn);
        }
        let total = (header_pages + page_count) as usize * page_size;
        let mut buf = vec![0u8; total];
        file.io.read_at(position * page_size as u64, &mut buf)?;
        let header_len = REC_PAGE_NUMBERS + 8 * page_count as usize;
        let stored_crc = read_u32(&buf, REC_CRC)?;
        let images = &buf[header_pages as usize * page_size..];
        let crc = record_crc32(
            tx_id as u64,
            &[&buf[..REC_CRC], &buf[REC_ROOT..header_len], images],
        );
        if crc != stored_crc {
            return Ok(ReadOutcome::Torn);
        }
        let mut pages = Vec::with_capacity(page_count as usize);
        for (idx, image) in images.chunks_exact(page_size).enumerate() {
            let page = read_u64(&buf, REC_PAGE_NUMBERS + idx * 8)?;
            pages.push((PageId(page), PageImage::from(image)));
        }
        Ok(ReadOutcome::Record(
            RecoveredTransaction {
                journal: file.number,
                tx_id: TxId(tx_id as u64),
                last_page_number: read_i64(&buf, REC_LAST_PAGE)?,
                root_state: buf[REC_ROOT..REC_ROOT + TREE_ROOT_HEADER_LEN].to_vec(),
                pages,
            },
            header_pages + page_count,
        ))
    }

    /// Appends `record`, rolling to a new file when the current one would
    /// exceed the maximum size. Returns the number of the file written.
    pub fn append(&self, record: &JournalRecord<'_>) -> Result<u64> {
        if record.root_state.len() > TREE_ROOT_HEADER_LEN {
            return Err(StorageError::Invalid("journal root state too large"));
        }
        let page_size = self.options.page_size;
        let count = record.pages.len();
        let header_pages = header_pages(count, page_size);
        let mut buf = vec![0u8; (header_pages + count) * page_size];
        write_u64(&mut buf, REC_MARKER, RECORD_MARKER)?;
        write_i64(&mut buf, REC_TX_ID, record.tx_id.0 as i64)?;
        write_i64(&mut buf, REC_LAST_PAGE, record.last_page_number)?;
        write_u32(&mut buf, REC_PAGE_COUNT, count as u32)?;
        buf[REC_ROOT..REC_ROOT + record.root_state.len()].copy_from_slice(record.root_state);
        for (idx, (page, image)) in record.pages.iter().enumerate() {
            if image.len() != page_size {
                return Err(StorageError::Invalid("journal page image size mismatch"));
            }
            write_u64(&mut buf, REC_PAGE_NUMBERS + idx * 8, page.0)?;
            let at = (header_pages + idx) * page_size;
            buf[at..at + page_size].copy_from_slice(image);
        }
        let header_len = REC_PAGE_NUMBERS + 8 * count;
        let crc = {
            let (header, images) = buf.split_at(header_pages * page_size);
            record_crc32(
                record.tx_id.0,
                &[&header[..REC_CRC], &header[REC_ROOT..header_len], images],
            )
        };
        write_u32(&mut buf, REC_CRC, crc)?;

        let record_pages = (header_pages + count) as u64;
        let file = self.writable_file(record_pages)?;
        file.append(&buf, record_pages, record.tx_id, &self.options)?;
        debug!(
            tx = record.tx_id.0,
            journal = file.number,
            pages = record_pages,
            "journal.append.completed"
        );
        Ok(file.number)
    }

    fn writable_file(&self, record_pages: u64) -> Result<Arc<JournalFile>> {
        let mut set = self.set.lock();
        let max_pages = self.options.max_file_size / self.options.page_size as u64;
        if let Some(current) = &set.current {
            let position = current.write_page_position();
            if position == 0 || position + record_pages <= max_pages {
                return Ok(Arc::clone(current));
            }
        }
        let number = set.next_number;
        let path = self.options.dir.join(journal_name(number));
        let file = Arc::new(JournalFile::open(number, path, &self.options)?);
        let initial_pages = (self.options.initial_file_size / self.options.page_size as u64).max(1);
        file.io
            .truncate(initial_pages * self.options.page_size as u64)?;
        file.state.lock().allocated_pages = initial_pages;
        set.next_number += 1;
        set.active.push(Arc::clone(&file));
        set.current = Some(Arc::clone(&file));
        info!(journal = number, "journal.file.created");
        Ok(file)
    }

    /// Retires every non-current file whose records are all at or before
    /// `up_to`. Returns the retired journal numbers.
    pub fn retire_through(&self, up_to: TxId) -> Vec<u64> {
        let mut set = self.set.lock();
        let current = set.current.as_ref().map(|file| file.number);
        let mut retired = Vec::new();
        set.active.retain(|file| {
            let done = Some(file.number) != current
                && file.last_transaction().map_or(true, |tx| tx <= up_to);
            if done {
                retired.push(file.number);
                file.retire();
            }
            !done
        });
        retired
    }

    /// Retires every file, including the current one. The next append starts
    /// a new file.
    pub fn retire_all(&self) -> Vec<u64> {
        let mut set = self.set.lock();
        set.current = None;
        let retired: Vec<u64> = set.active.iter().map(|file| file.number).collect();
        for file in set.active.drain(..) {
            file.retire();
        }
        retired
    }

    /// Files still needed for recovery, in number order.
    pub fn files(&self) -> Vec<Arc<JournalFile>> {
        self.set.lock().active.clone()
    }

    /// File currently receiving appends.
    pub fn current(&self) -> Option<Arc<JournalFile>> {
        self.set.lock().current.clone()
    }

    /// Pins every live file together with its written length.
    pub fn snapshot(&self) -> Vec<JournalSnapshot> {
        let set = self.set.lock();
        set.active
            .iter()
            .map(|file| JournalSnapshot {
                pages: file.write_page_position(),
                file: file.add_ref(),
            })
            .collect()
    }

    /// Number of the newest file ever created, if any.
    pub fn last_created(&self) -> Option<u64> {
        self.set.lock().next_number.checked_sub(1)
    }
}

enum ReadOutcome {
    End,
    Torn,
    Record(RecoveredTransaction, u64),
}

fn header_pages(page_count: usize, page_size: usize) -> usize {
    (REC_PAGE_NUMBERS + 8 * page_count).div_ceil(page_size)
}
