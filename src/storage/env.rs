//! Storage environment: owns the header files, the data file and the
//! journal, and hands out transactions.

use std::collections::BTreeMap;
use std::fs;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::journal::{Journal, JournalOptions, JournalRecord};
use crate::primitives::pager::{PageImage, PageSource};
use crate::storage::header::TreeRootHeader;
use crate::storage::header_accessor::HeaderAccessor;
use crate::storage::llt::LowLevelTransaction;
use crate::storage::options::StorageOptions;
use crate::storage::transaction::Transaction;
use crate::types::{PageId, Result, StorageError, TxId, DATA_FILE_NAME};

/// State a transaction starts from.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReaderSnapshot {
    pub tx: TxId,
    pub root: TreeRootHeader,
    pub next_page: u64,
}

#[derive(Clone, Copy, Debug)]
struct CommittedMeta {
    root: TreeRootHeader,
    last_page_number: i64,
    journal: u64,
}

struct EnvState {
    last_committed: TxId,
    root: TreeRootHeader,
    next_page: u64,
    /// Committed but not yet flushed transactions.
    committed: BTreeMap<TxId, CommittedMeta>,
    /// Live snapshots and how many transactions hold each.
    readers: BTreeMap<TxId, usize>,
}

/// Outcome of applying journaled transactions to the data file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    /// Newest transaction now contained in the data file.
    pub flushed_through: u64,
    /// Pages written to the data file.
    pub pages_written: usize,
    /// Journal files retired by this flush.
    pub retired_journals: Vec<u64>,
}

/// An open store.
pub struct StorageEnvironment {
    options: StorageOptions,
    header: HeaderAccessor,
    pager: PageSource,
    journal: Journal,
    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    state: Mutex<EnvState>,
}

impl StorageEnvironment {
    /// Opens the store described by `options`, creating it when the base
    /// directory holds no header files. Journaled transactions newer than
    /// the persisted header are replayed into the data file.
    pub fn open(options: StorageOptions) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.base_path)?;
        fs::create_dir_all(options.journal_dir())?;

        let header = HeaderAccessor::new(
            &options.base_path,
            options.page_size,
            options.notifications.clone(),
        );
        let created = header.initialize()?;
        let file_header = header.header()?;
        let page_size = file_header.page_size as usize;
        let pager = PageSource::open(
            options.base_path.join(DATA_FILE_NAME),
            page_size,
            options.cache_pages,
        )?;
        let min_next_journal = (file_header.journal.current_journal + 1)
            .max(file_header.incremental_backup.last_created_journal + 1)
            .max(0) as u64;
        let journal = Journal::open(
            JournalOptions {
                dir: options.journal_dir().to_path_buf(),
                page_size,
                initial_file_size: options.initial_log_file_size,
                max_file_size: options.max_log_file_size,
                sync: options.sync_journal,
                keep_retired: options.incremental_backup_enabled,
            },
            min_next_journal,
        )?;

        let mut last_committed = file_header.last_transaction()?;
        let mut root = file_header.root;
        let mut next_page = file_header.allocated_pages();

        let mut recovered: Option<(TxId, i64, Vec<u8>, u64)> = None;
        let report = journal.recover(last_committed, |record| {
            pager.publish(record.tx_id, record.pages);
            recovered = Some((
                record.tx_id,
                record.last_page_number,
                record.root_state,
                record.journal,
            ));
            Ok(())
        })?;
        if let Some((tx, last_page_number, root_state, journal_number)) = recovered {
            let recovered_root = TreeRootHeader::decode(&root_state)?;
            pager.flush(tx)?;
            header.modify(|h| {
                h.transaction_id = tx.0 as i64;
                h.last_page_number = last_page_number;
                h.root = recovered_root;
                h.journal.last_synced_journal = journal_number as i64;
                h.journal.last_synced_transaction_id = tx.0 as i64;
                h.journal.current_journal = -1;
                h.journal.journal_files_count = 0;
            })?;
            last_committed = tx;
            root = recovered_root;
            next_page = (last_page_number + 1).max(0) as u64;
        }
        if report.torn {
            warn!(last_tx = last_committed.0, "storage.recovery.torn_journal");
        }
        let retired = journal.retire_all();
        if let Some(last) = journal.last_created() {
            if options.incremental_backup_enabled {
                header.modify(|h| h.incremental_backup.last_created_journal = last as i64)?;
            }
        }
        info!(
            path = %options.base_path.display(),
            created,
            page_size,
            last_tx = last_committed.0,
            replayed = report.applied,
            retired = retired.len(),
            "storage.env.opened"
        );

        let env = Self {
            options,
            header,
            pager,
            journal,
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            state: Mutex::new(EnvState {
                last_committed,
                root,
                next_page,
                committed: BTreeMap::new(),
                readers: BTreeMap::new(),
            }),
        };
        if root.root_page.is_none() {
            env.create_root_tree()?;
        }
        Ok(env)
    }

    fn create_root_tree(&self) -> Result<()> {
        let mut tx = self.begin_write()?;
        {
            let (root, pages) = tx.root_and_pages();
            root.ensure_root(pages)?;
        }
        tx.commit()?;
        if self.options.manual_flush {
            self.flush_log_to_data_file()?;
        }
        Ok(())
    }

    /// Options the environment was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Page size of the store; the persisted value wins over the options.
    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    /// Header accessor of the store.
    pub fn header(&self) -> &HeaderAccessor {
        &self.header
    }

    /// Journal of the store.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub(crate) fn pager(&self) -> &PageSource {
        &self.pager
    }

    /// Newest committed transaction.
    pub fn last_committed(&self) -> TxId {
        self.state.lock().last_committed
    }

    /// Pages allocated as of the newest committed transaction.
    pub fn number_of_allocated_pages(&self) -> u64 {
        self.state.lock().next_page
    }

    /// Numbers of the journal files still needed for recovery.
    pub fn journal_files(&self) -> Vec<u64> {
        self.journal.files().iter().map(|file| file.number()).collect()
    }

    /// Number of the journal file receiving appends.
    pub fn current_journal(&self) -> Option<u64> {
        self.journal.current().map(|file| file.number())
    }

    /// Page versions committed to the journal but not yet in the data file.
    pub fn pending_pages(&self) -> usize {
        self.pager.pending_pages()
    }

    fn register_reader(&self) -> ReaderSnapshot {
        let mut state = self.state.lock();
        let tx = state.last_committed;
        *state.readers.entry(tx).or_insert(0) += 1;
        ReaderSnapshot {
            tx,
            root: state.root,
            next_page: state.next_page,
        }
    }

    pub(crate) fn unregister_reader(&self, tx: TxId) {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&tx) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&tx);
            }
        }
    }

    /// Starts a snapshot read at the newest committed transaction.
    pub fn begin_read(&self) -> Result<LowLevelTransaction<'_>> {
        Ok(LowLevelTransaction::new(self, self.register_reader(), None))
    }

    /// Starts the single write transaction, waiting for the current writer to
    /// finish.
    pub fn begin_write(&self) -> Result<LowLevelTransaction<'_>> {
        let guard = self.write_lock.lock();
        Ok(LowLevelTransaction::new(self, self.register_reader(), Some(guard)))
    }

    /// Starts a read transaction with tree access.
    pub fn read_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new(self.begin_read()?))
    }

    /// Starts a write transaction with tree access.
    pub fn write_transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new(self.begin_write()?))
    }

    pub(crate) fn commit_transaction(
        &self,
        tx: TxId,
        root: TreeRootHeader,
        last_page_number: i64,
        pages: Vec<(PageId, PageImage)>,
    ) -> Result<()> {
        let root_state = root.encode();
        let journal = self.journal.append(&JournalRecord {
            tx_id: tx,
            last_page_number,
            root_state: &root_state,
            pages: &pages,
        })?;
        let page_count = pages.len();
        self.pager.publish(tx, pages);
        let mut state = self.state.lock();
        state.last_committed = tx;
        state.root = root;
        state.next_page = (last_page_number + 1).max(0) as u64;
        state.committed.insert(
            tx,
            CommittedMeta {
                root,
                last_page_number,
                journal,
            },
        );
        debug!(tx = tx.0, pages = page_count, journal, "storage.tx.committed");
        Ok(())
    }

    pub(crate) fn lock_flush(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    /// Applies journaled transactions to the data file, up to the oldest
    /// transaction a live reader still depends on, then persists the header
    /// and retires journals that are no longer needed.
    pub fn flush_log_to_data_file(&self) -> Result<FlushReport> {
        let _flush = self.flush_lock.lock();
        let flushed = TxId(self.header.get(|h| h.transaction_id.max(0) as u64)?);
        let target = {
            let state = self.state.lock();
            let oldest = state
                .readers
                .keys()
                .next()
                .copied()
                .unwrap_or(state.last_committed);
            let up_to = oldest.min(state.last_committed);
            state
                .committed
                .range(..=up_to)
                .next_back()
                .map(|(tx, meta)| (*tx, *meta))
        };
        let Some((up_to, meta)) = target.filter(|(tx, _)| *tx > flushed) else {
            return Ok(FlushReport {
                flushed_through: flushed.0,
                ..FlushReport::default()
            });
        };

        let pages_written = self.pager.flush(up_to)?;
        let current = self.journal.current().map(|file| file.number());
        let remaining = self
            .journal
            .files()
            .iter()
            .filter(|file| {
                Some(file.number()) == current
                    || file.last_transaction().is_some_and(|tx| tx > up_to)
            })
            .count();
        let keep_retired = self.options.incremental_backup_enabled;
        let last_created = self.journal.last_created();
        self.header.modify(|h| {
            h.transaction_id = up_to.0 as i64;
            h.last_page_number = meta.last_page_number;
            h.root = meta.root;
            h.journal.last_synced_journal = meta.journal as i64;
            h.journal.last_synced_transaction_id = up_to.0 as i64;
            h.journal.current_journal = current.map_or(-1, |n| n as i64);
            h.journal.journal_files_count = remaining as i32;
            if keep_retired {
                if let Some(last) = last_created {
                    h.incremental_backup.last_created_journal = last as i64;
                }
            }
        })?;
        let retired_journals = self.journal.retire_through(up_to);
        self.state.lock().committed.retain(|tx, _| *tx > up_to);
        info!(
            flushed_through = up_to.0,
            pages = pages_written,
            retired = retired_journals.len(),
            "storage.flush.completed"
        );
        Ok(FlushReport {
            flushed_through: up_to.0,
            pages_written,
            retired_journals,
        })
    }

    /// Retires every journal file, the current one included. Fails when the
    /// journals still hold transactions missing from the data file.
    pub fn truncate_journals(&self) -> Result<Vec<u64>> {
        let _flush = self.flush_lock.lock();
        if self.pager.pending_pages() > 0 || !self.state.lock().committed.is_empty() {
            return Err(StorageError::Invalid(
                "journals hold transactions not yet flushed",
            ));
        }
        let retired = self.journal.retire_all();
        self.header.modify(|h| {
            h.journal.current_journal = -1;
            h.journal.journal_files_count = 0;
        })?;
        info!(retired = retired.len(), "storage.journal.truncated");
        Ok(retired)
    }

    /// Cuts the data file down to the allocated pages. Returns the new length
    /// in pages.
    pub fn shrink_data_file(&self) -> Result<u64> {
        let _flush = self.flush_lock.lock();
        if self.pager.pending_pages() > 0 {
            return Err(StorageError::Invalid(
                "data file has unflushed transactions",
            ));
        }
        let pages = self.state.lock().next_page;
        self.pager.set_length(pages)?;
        info!(pages, "storage.data_file.shrunk");
        Ok(pages)
    }
}
