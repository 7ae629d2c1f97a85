//! Offline compaction: every live record of a store is rewritten into a fresh
//! store, which is then cut down to the pages it actually uses.
//!
//! Records are copied in sub-transactions bounded by half the destination's
//! journal size, and the destination is flushed after each one. Free-space
//! bookkeeping is not copied; the destination starts with none.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::storage::fixed::slot::FixedSlot;
use crate::storage::record_flags;
use crate::storage::{FixedTree, StorageEnvironment, StorageOptions, Transaction};
use crate::types::{RootObjectType, StorageError, DATA_FILE_NAME, FREE_SPACE_TREE_NAME};

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::store_exists;
use crate::admin::{AdminError, Result};

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionProgress {
    /// Root object being copied.
    pub tree: String,
    /// Kind of that root object.
    pub kind: RootObjectType,
    /// Root objects finished so far, skipped ones included.
    pub copied_trees: usize,
    /// Root objects in the source.
    pub total_trees: usize,
    /// Entries of the current root object copied so far.
    pub copied_entries: u64,
    /// Entries of the current root object.
    pub total_entries: u64,
}

/// Report generated after a compaction completes.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    /// Store that was read.
    pub source: PathBuf,
    /// Store that was written.
    pub destination: PathBuf,
    /// Root objects copied, skipped bookkeeping trees included.
    pub trees_copied: usize,
    /// Top-level entries copied across all root objects.
    pub entries_copied: u64,
    /// Write transactions committed on the destination.
    pub sub_transactions: u64,
    /// Data file size of the source in bytes.
    pub source_bytes: u64,
    /// Data file size of the destination in bytes.
    pub destination_bytes: u64,
    /// Duration of the compaction in milliseconds.
    pub duration_ms: f64,
}

/// Callback receiving progress updates.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(&CompactionProgress);

struct Progress<'a> {
    callback: Option<ProgressCallback<'a>>,
    state: CompactionProgress,
}

impl Progress<'_> {
    fn emit(&mut self) {
        if let Some(callback) = self.callback.as_mut() {
            callback(&self.state);
        }
    }

    fn start_tree(&mut self, name: &str, kind: RootObjectType, total_entries: u64) {
        self.state.tree = name.to_owned();
        self.state.kind = kind;
        self.state.copied_entries = 0;
        self.state.total_entries = total_entries;
        self.emit();
    }

    fn entries(&mut self, copied: u64) {
        self.state.copied_entries += copied;
        self.emit();
    }

    fn finish_tree(&mut self) {
        self.state.copied_trees += 1;
        self.emit();
    }
}

#[derive(Debug)]
enum SourceRecord {
    Data {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Multi {
        key: Vec<u8>,
        values: Vec<Vec<u8>>,
    },
    Fixed {
        key: Vec<u8>,
        value_size: u16,
        entries: Vec<(i64, Vec<u8>)>,
    },
}

impl SourceRecord {
    fn key(&self) -> &[u8] {
        match self {
            SourceRecord::Data { key, .. }
            | SourceRecord::Multi { key, .. }
            | SourceRecord::Fixed { key, .. } => key,
        }
    }
}

struct Batch<T> {
    records: Vec<T>,
    more: bool,
}

/// One-shot copy of a store into a new, densely packed store.
#[derive(Debug)]
pub struct StorageCompaction {
    source: StorageOptions,
    destination: StorageOptions,
    executed: bool,
}

impl StorageCompaction {
    /// Prepares a compaction of the store described by `source` into
    /// `destination`. Both are opened in manual-flush mode.
    pub fn new(source: StorageOptions, destination: StorageOptions) -> Self {
        Self {
            source: source.manual_flush(true),
            destination: destination.manual_flush(true),
            executed: false,
        }
    }

    /// Copies every root object and shrinks the destination.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExecuted` on a second call and
    /// `IncrementalBackupConflict` when the source keeps incremental backups,
    /// both before any file is opened.
    pub fn execute(&mut self, progress: Option<ProgressCallback<'_>>) -> Result<CompactionReport> {
        if self.executed {
            return Err(StorageError::AlreadyExecuted("storage compaction").into());
        }
        self.executed = true;
        if self.source.incremental_backup_enabled {
            return Err(StorageError::IncrementalBackupConflict.into());
        }
        if self.source.base_path == self.destination.base_path {
            return Err(AdminError::Message(
                "compaction destination must differ from source".to_string(),
            ));
        }
        if !store_exists(&self.source.base_path) {
            return Err(AdminError::missing_database(&self.source.base_path));
        }
        if store_exists(&self.destination.base_path) {
            return Err(AdminError::Message(format!(
                "compaction destination already holds a store: {}",
                self.destination.base_path.display()
            )));
        }

        let start = Instant::now();
        let budget = (self.destination.max_log_file_size / 2).max(1);
        let source = StorageEnvironment::open(self.source.clone())?;
        let destination = StorageEnvironment::open(self.destination.clone())?;
        let mut src = source.read_transaction()?;
        let roots = src.root_objects()?;

        let mut progress = Progress {
            callback: progress,
            state: CompactionProgress {
                tree: String::new(),
                kind: RootObjectType::None,
                copied_trees: 0,
                total_trees: roots.len(),
                copied_entries: 0,
                total_entries: 0,
            },
        };
        let mut entries_copied = 0;
        let mut sub_transactions = 0;
        for (name, kind) in &roots {
            if name == FREE_SPACE_TREE_NAME {
                progress.start_tree(name, *kind, 0);
                progress.finish_tree();
                continue;
            }
            let (entries, commits) = match kind {
                RootObjectType::VariableSizeTree => {
                    copy_variable_tree(&mut src, &destination, name, budget, &mut progress)?
                }
                RootObjectType::FixedSizeTree => {
                    copy_fixed_tree(&mut src, &destination, name, budget, &mut progress)?
                }
                other => {
                    warn!(tree = %name, kind = ?other, "admin.compaction.unexpected_root");
                    (0, 0)
                }
            };
            entries_copied += entries;
            sub_transactions += commits;
            progress.finish_tree();
            debug!(tree = %name, entries, commits, "admin.compaction.tree_copied");
        }
        src.dispose();

        destination.flush_log_to_data_file()?;
        destination.truncate_journals()?;
        destination.shrink_data_file()?;

        let report = CompactionReport {
            source: self.source.base_path.clone(),
            destination: self.destination.base_path.clone(),
            trees_copied: progress.state.copied_trees,
            entries_copied,
            sub_transactions,
            source_bytes: data_file_len(&self.source.base_path)?,
            destination_bytes: data_file_len(&self.destination.base_path)?,
            duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
        };
        info!(
            source = %report.source.display(),
            destination = %report.destination.display(),
            trees = report.trees_copied,
            entries = report.entries_copied,
            before = report.source_bytes,
            after = report.destination_bytes,
            "admin.compaction.completed"
        );
        Ok(report)
    }
}

/// Compacts the store at `src` into a new store at `dst`, using `opts` for
/// both sides. The destination keeps its journals next to its data file.
///
/// # Errors
///
/// See [`StorageCompaction::execute`].
pub fn compact(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    progress: Option<ProgressCallback<'_>>,
) -> Result<CompactionReport> {
    let source = opts.storage_options(src.as_ref());
    let mut destination = opts.storage_options(dst.as_ref());
    destination.journal_path = None;
    StorageCompaction::new(source, destination).execute(progress)
}

fn data_file_len(dir: &Path) -> Result<u64> {
    Ok(fs::metadata(dir.join(DATA_FILE_NAME))?.len())
}

fn copy_variable_tree(
    src: &mut Transaction<'_>,
    dst: &StorageEnvironment,
    name: &str,
    budget: u64,
    progress: &mut Progress<'_>,
) -> Result<(u64, u64)> {
    let total = src
        .read_tree(name)?
        .ok_or_else(|| StorageError::NotFound(name.to_owned()))?
        .number_of_entries()?;
    progress.start_tree(name, RootObjectType::VariableSizeTree, total);
    let mut resume: Option<Vec<u8>> = None;
    let mut copied = 0;
    let mut commits = 0;
    loop {
        let batch = read_variable_batch(src, name, resume.as_deref(), budget)?;
        let mut tx = dst.write_transaction()?;
        {
            let mut tree = tx.create_tree(name)?;
            for record in &batch.records {
                match record {
                    SourceRecord::Data { key, value } => tree.add(key, value)?,
                    SourceRecord::Multi { key, values } => {
                        for value in values {
                            tree.multi_add(key, value)?;
                        }
                    }
                    SourceRecord::Fixed {
                        key,
                        value_size,
                        entries,
                    } => {
                        let mut fixed = tree.fixed_tree_for(key, *value_size)?;
                        for (k, v) in entries {
                            fixed.add(*k, v)?;
                        }
                    }
                }
            }
        }
        tx.commit()?;
        dst.flush_log_to_data_file()?;
        commits += 1;
        copied += batch.records.len() as u64;
        progress.entries(batch.records.len() as u64);
        if !batch.more {
            break;
        }
        resume = batch.records.last().map(|record| record.key().to_vec());
    }
    Ok((copied, commits))
}

/// Reads records after `after` until roughly `budget` bytes are collected.
fn read_variable_batch(
    src: &mut Transaction<'_>,
    name: &str,
    after: Option<&[u8]>,
    budget: u64,
) -> Result<Batch<SourceRecord>> {
    let mut tree = src
        .read_tree(name)?
        .ok_or_else(|| StorageError::NotFound(name.to_owned()))?;
    let mut records = Vec::new();
    let mut bytes = 0u64;
    let mut more = false;
    {
        let mut iter = tree.iter()?;
        let mut valid = match after {
            Some(key) => {
                let found = iter.seek(key)?;
                if found && iter.current_key()? == key {
                    iter.move_next()?
                } else {
                    found
                }
            }
            None => iter.seek_first()?,
        };
        while valid {
            if bytes >= budget && !records.is_empty() {
                more = true;
                break;
            }
            let record = iter.current()?;
            let key = record.key.to_vec();
            bytes += key.len() as u64;
            match record.flags {
                record_flags::MULTI_VALUE => {
                    let values = iter.multi_values()?;
                    bytes += values.iter().map(|v| v.len() as u64).sum::<u64>();
                    records.push(SourceRecord::Multi { key, values });
                }
                record_flags::FIXED_SIZE_TREE => {
                    let slot = FixedSlot::decode(record.value)?;
                    bytes += slot.number_of_entries() * (8 + slot.value_size as u64);
                    records.push(SourceRecord::Fixed {
                        key,
                        value_size: slot.value_size,
                        entries: Vec::new(),
                    });
                }
                _ => {
                    bytes += record.value.len() as u64;
                    records.push(SourceRecord::Data {
                        key,
                        value: record.value.to_vec(),
                    });
                }
            }
            valid = iter.move_next()?;
        }
    }
    for record in records.iter_mut() {
        if let SourceRecord::Fixed {
            key,
            value_size,
            entries,
        } = record
        {
            let mut fixed = tree.fixed_tree_for(key, *value_size)?;
            *entries = read_fixed_batch(&mut fixed, i64::MIN, u64::MAX)?.records;
        }
    }
    Ok(Batch { records, more })
}

fn copy_fixed_tree(
    src: &mut Transaction<'_>,
    dst: &StorageEnvironment,
    name: &str,
    budget: u64,
    progress: &mut Progress<'_>,
) -> Result<(u64, u64)> {
    let value_size = src
        .fixed_tree_value_size(name)?
        .ok_or_else(|| StorageError::NotFound(name.to_owned()))?;
    let total = src.fixed_tree_for(name, value_size)?.number_of_entries()?;
    progress.start_tree(name, RootObjectType::FixedSizeTree, total);
    let mut from = i64::MIN;
    let mut copied = 0;
    let mut commits = 0;
    loop {
        let batch = {
            let mut fixed = src.fixed_tree_for(name, value_size)?;
            read_fixed_batch(&mut fixed, from, budget)?
        };
        if batch.records.is_empty() && commits > 0 {
            break;
        }
        let mut tx = dst.write_transaction()?;
        {
            let mut fixed = tx.fixed_tree_for(name, value_size)?;
            for (key, value) in &batch.records {
                fixed.add(*key, value)?;
            }
        }
        tx.commit()?;
        dst.flush_log_to_data_file()?;
        commits += 1;
        copied += batch.records.len() as u64;
        progress.entries(batch.records.len() as u64);
        let next = batch
            .records
            .last()
            .and_then(|(key, _)| key.checked_add(1));
        match next {
            Some(next) if batch.more => from = next,
            _ => break,
        }
    }
    Ok((copied, commits))
}

/// Entries with keys `>= from` until roughly `budget` bytes are collected.
fn read_fixed_batch(
    fixed: &mut FixedTree<'_, '_>,
    from: i64,
    budget: u64,
) -> Result<Batch<(i64, Vec<u8>)>> {
    let entry_len = 8 + fixed.value_size() as u64;
    let mut records = Vec::new();
    let mut bytes = 0u64;
    let mut iter = fixed.iter()?;
    let mut valid = iter.seek(from)?;
    while valid {
        if bytes >= budget && !records.is_empty() {
            return Ok(Batch {
                records,
                more: true,
            });
        }
        records.push((iter.current_key()?, iter.value()?));
        bytes += entry_len;
        valid = iter.move_next()?;
    }
    Ok(Batch {
        records,
        more: false,
    })
}
