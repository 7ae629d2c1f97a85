//! Full backups into a zip archive and their restore.
//!
//! A backup pins a consistent point of the store with a short-lived write
//! transaction used purely as a fence: while it is held, the header files,
//! the list of live journals with their written lengths and the allocated
//! page count are captured, and a read transaction pins the matching
//! snapshot. Flushing is held off until the copy finishes, so the data file
//! and the captured headers keep agreeing with each other.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::primitives::io::FileIo;
use crate::storage::StorageEnvironment;
use crate::types::{journal_name, StorageError, DATA_FILE_NAME, JOURNAL_EXTENSION};

use crate::admin::util::ensure_parent_dir;
use crate::admin::{AdminError, Result};

/// Progress of a [`FullBackup`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum BackupStage {
    /// `execute` has not been called.
    NotStarted,
    /// Both header files are in the archive.
    HeadersCopied,
    /// Live journals are pinned and their lengths recorded.
    JournalsSnapshotted,
    /// The data file prefix is in the archive.
    DataCopied,
    /// Every pinned journal is in the archive.
    JournalsCopied,
    /// The archive is complete.
    Finished,
}

/// Options controlling the archive.
#[derive(Clone, Copy, Debug)]
pub struct BackupOptions {
    /// Deflate level, `0` stores entries uncompressed.
    pub compression_level: i32,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            compression_level: 6,
        }
    }
}

impl BackupOptions {
    fn file_options(&self) -> FileOptions {
        let options = FileOptions::default();
        if self.compression_level <= 0 {
            options.compression_method(CompressionMethod::Stored)
        } else {
            options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(self.compression_level.min(9)))
        }
    }
}

/// Report generated after a backup completes.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// Archive written.
    pub archive: PathBuf,
    /// Newest transaction contained in the backup.
    pub transaction_id: u64,
    /// Allocated pages at the fence.
    pub allocated_pages: u64,
    /// Bytes of the data file stored in the archive.
    pub data_bytes: u64,
    /// Journal numbers stored in the archive.
    pub journals: Vec<u64>,
    /// Journal bytes stored in the archive.
    pub journal_bytes: u64,
    /// Size of the finished archive.
    pub archive_bytes: u64,
    /// Duration of the backup in milliseconds.
    pub duration_ms: f64,
}

/// One-shot full backup of a store.
#[derive(Debug)]
pub struct FullBackup {
    options: BackupOptions,
    stage: BackupStage,
    started: bool,
}

impl FullBackup {
    /// Creates a backup that has not run yet.
    pub fn new(options: BackupOptions) -> Self {
        Self {
            options,
            stage: BackupStage::NotStarted,
            started: false,
        }
    }

    /// Last stage reached.
    pub fn stage(&self) -> BackupStage {
        self.stage
    }

    /// Writes a full backup of `env` to the zip archive at `archive`.
    ///
    /// A failure leaves a partial archive behind; it must be discarded.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExecuted` when called a second time, without touching
    /// the store or the archive.
    pub fn execute(&mut self, env: &StorageEnvironment, archive: impl AsRef<Path>) -> Result<BackupReport> {
        if self.started {
            return Err(StorageError::AlreadyExecuted("full backup").into());
        }
        self.started = true;
        let archive = archive.as_ref();
        let start = Instant::now();

        ensure_parent_dir(archive)?;
        let file = File::create(archive)?;
        let mut zip = ZipWriter::new(file);
        let entry = self.options.file_options();
        let page_size = env.page_size() as u64;

        let mut fence = env.begin_write()?;
        let snapshot = env.begin_read()?;
        let _flush = env.lock_flush();
        let headers = env.header().copy_header_files()?;
        let transaction_id = snapshot.id().0;
        let allocated_pages = snapshot.pages().allocated_pages();
        for (name, bytes) in &headers {
            zip.start_file(*name, entry)?;
            zip.write_all(bytes)?;
        }
        self.stage = BackupStage::HeadersCopied;

        let journals = env.journal().snapshot();
        fence.dispose();
        self.stage = BackupStage::JournalsSnapshotted;
        debug!(
            tx = transaction_id,
            pages = allocated_pages,
            journals = journals.len(),
            "admin.backup.fenced"
        );

        let data = env.pager().file();
        let data_len = (allocated_pages * page_size).min(data.len()?);
        zip.start_file(DATA_FILE_NAME, entry)?;
        let data_bytes = data.copy_prefix_to(data_len, &mut zip)?;
        self.stage = BackupStage::DataCopied;

        let mut journal_numbers = Vec::with_capacity(journals.len());
        let mut journal_bytes = 0;
        for journal in &journals {
            zip.start_file(journal_name(journal.file.number()), entry)?;
            journal_bytes += journal.file.copy_pages_to(journal.pages, &mut zip)?;
            journal_numbers.push(journal.file.number());
        }
        drop(journals);
        self.stage = BackupStage::JournalsCopied;

        zip.finish()?;
        drop(snapshot);
        let archive_bytes = fs::metadata(archive)?.len();
        self.stage = BackupStage::Finished;

        let report = BackupReport {
            archive: archive.to_path_buf(),
            transaction_id,
            allocated_pages,
            data_bytes,
            journals: journal_numbers,
            journal_bytes,
            archive_bytes,
            duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
        };
        info!(
            archive = %archive.display(),
            tx = report.transaction_id,
            journals = report.journals.len(),
            bytes = report.archive_bytes,
            "admin.backup.completed"
        );
        Ok(report)
    }
}

/// Report generated after a restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// Files written to the data directory.
    pub data_files: Vec<String>,
    /// Files written to the journal directory.
    pub journal_files: Vec<String>,
    /// Bytes extracted.
    pub bytes: u64,
}

/// Extracts a backup archive. Journal files go to `journal_dir` when given,
/// every other entry to `data_dir`. Contents are not replayed or validated;
/// that happens when the store is next opened.
///
/// # Errors
///
/// Returns an error if the archive cannot be read, an entry escapes the
/// target directory, or a file cannot be written.
pub fn restore(archive: impl AsRef<Path>, data_dir: impl AsRef<Path>, journal_dir: Option<&Path>) -> Result<RestoreReport> {
    let archive = archive.as_ref();
    let data_dir = data_dir.as_ref();
    let journal_dir = journal_dir.unwrap_or(data_dir);
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(data_dir)?;
    fs::create_dir_all(journal_dir)?;

    let mut report = RestoreReport {
        data_files: Vec::new(),
        journal_files: Vec::new(),
        bytes: 0,
    };
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(AdminError::Message(format!(
                "archive entry escapes the target directory: {}",
                entry.name()
            )));
        };
        let is_journal = name
            .extension()
            .is_some_and(|ext| ext == JOURNAL_EXTENSION);
        let target = if is_journal {
            journal_dir.join(&name)
        } else {
            data_dir.join(&name)
        };
        ensure_parent_dir(&target)?;
        let mut out = File::create(&target)?;
        report.bytes += io::copy(&mut entry, &mut out)?;
        out.sync_all()?;
        let label = name.to_string_lossy().into_owned();
        if is_journal {
            report.journal_files.push(label);
        } else {
            report.data_files.push(label);
        }
    }
    info!(
        archive = %archive.display(),
        data = report.data_files.len(),
        journals = report.journal_files.len(),
        "admin.restore.completed"
    );
    Ok(report)
}
