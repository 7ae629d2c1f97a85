//! Bookkeeping of released pages.
//!
//! Pages freed by a write transaction are recorded in the `$free-space`
//! fixed-size tree when the transaction prepares. The allocator never hands
//! them out again; compaction is what reclaims the space.

use tracing::debug;

use crate::storage::transaction::Transaction;
use crate::types::{PageId, Result};

/// Records every page the transaction freed. Returns how many were added.
pub(crate) fn record_freed_pages(tx: &mut Transaction<'_>) -> Result<usize> {
    let mut recorded = 0;
    loop {
        let freed = tx.pages_mut()?.take_freed();
        if freed.is_empty() {
            break;
        }
        recorded += freed.len();
        let mut tree = tx.free_space_tree()?;
        for page in freed {
            tree.add(page.0 as i64, &[])?;
        }
    }
    if recorded > 0 {
        debug!(pages = recorded, "storage.free_space.recorded");
    }
    Ok(recorded)
}

/// Pages recorded as free, in page order.
pub fn freed_pages(tx: &mut Transaction<'_>) -> Result<Vec<PageId>> {
    let mut tree = tx.free_space_tree()?;
    let mut out = Vec::with_capacity(tree.number_of_entries()? as usize);
    let mut iter = tree.iter()?;
    let mut more = iter.seek(i64::MIN)?;
    while more {
        out.push(PageId(iter.current_key()? as u64));
        more = iter.move_next()?;
    }
    Ok(out)
}
