//! Transactional page storage: headers, trees, transactions and the
//! environment that ties them to the data file and the journal.

/// Store environment and flushing.
pub mod env;

/// Fixed-size trees keyed by `i64`.
pub mod fixed;

/// Free-page bookkeeping.
pub mod free_space;

/// On-disk file header and tree root header layouts.
pub mod header;

/// Dual-file header persistence.
pub mod header_accessor;

/// Page-level transactions.
pub mod llt;

/// Environment options and notifications.
pub mod options;

/// Named-tree transactions.
pub mod transaction;

/// Variable-size trees.
pub mod tree;

/// Main entry point of the engine.
pub use env::{FlushReport, StorageEnvironment};

/// Fixed-size tree handles and cursors.
pub use fixed::{FixedSizeTreeIterator, FixedTree, FixedTreeShape, ValueReader};

/// Header layouts.
pub use header::{FileHeader, TreeRootHeader, CURRENT_VERSION, HEADER_FILE_NAMES};

/// Header persistence.
pub use header_accessor::HeaderAccessor;

/// Page-level transaction types.
pub use llt::{LowLevelTransaction, PageRef, TransactionFlags, TxPages};

/// Configuration.
pub use options::{NotificationHook, StorageNotification, StorageOptions};

/// Tree-level transaction types.
pub use transaction::{CommitParticipant, Transaction, TreeMut};

/// Variable-size tree types.
pub use tree::{record_flags, Tree, TreeIterator, TreeRecord};
