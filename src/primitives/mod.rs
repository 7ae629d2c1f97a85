//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, file I/O, the page source over the data file,
//! and the write-ahead journal.

/// Byte-level utilities and encoding/decoding.
///
/// Bounds-checked little-endian accessors over page buffers.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Interfaces for positioned reads and writes on files.
pub mod io;

/// Write-ahead journal for crash recovery.
///
/// Ensures durability by logging every committed transaction's pages before
/// they reach the data file.
pub mod journal;

/// Page source over the data file.
///
/// Serves snapshot reads from committed page versions and the data file.
pub mod pager;
