//! Voron: an embedded, transactional, page-oriented storage engine.
//!
//! A store is a data file plus a sequence of journal files and two redundant
//! header files. Single-writer, multi-reader transactions work over
//! variable-size and fixed-size trees; backup and compaction run on top of
//! the same transaction API.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{StorageEnvironment, StorageOptions, Transaction};
pub use types::{PageId, Result, StorageError, TxId};
