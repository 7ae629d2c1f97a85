#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use proptest::prelude::*;
use voron::storage::{FileHeader, HeaderAccessor, HEADER_FILE_NAMES};
use voron::StorageError;

const PAGE_SIZE: u32 = 4096;

fn read_header(dir: &Path, name: &str) -> Option<FileHeader> {
    let bytes = fs::read(dir.join(name)).ok()?;
    FileHeader::decode(&bytes).ok().filter(FileHeader::has_valid_marker)
}

fn tear(dir: &Path, name: &str) {
    let path = dir.join(name);
    let mut bytes = fs::read(&path).unwrap();
    bytes[..8].fill(0);
    fs::write(&path, bytes).unwrap();
}

#[test]
fn writes_alternate_between_files() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let accessor = HeaderAccessor::new(dir.path(), PAGE_SIZE, None);
    assert!(accessor.initialize()?);

    for n in 0..6i64 {
        let header = accessor.modify(|h| h.transaction_id = n + 1)?;
        assert_eq!(header.header_revision, n);
        let written = HEADER_FILE_NAMES[(n % 2) as usize];
        let other = HEADER_FILE_NAMES[((n + 1) % 2) as usize];
        assert_eq!(HeaderAccessor::file_for_revision(n), written);
        let on_disk = read_header(dir.path(), written).unwrap();
        assert_eq!(on_disk.header_revision, n);
        assert_eq!(on_disk.transaction_id, n + 1);
        let previous = read_header(dir.path(), other).unwrap();
        assert_eq!(previous.header_revision, n - 1);
    }
    Ok(())
}

#[test]
fn torn_write_falls_back_to_previous_revision() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let accessor = HeaderAccessor::new(dir.path(), PAGE_SIZE, None);
        accessor.initialize()?;
        accessor.modify(|h| h.transaction_id = 10)?;
        accessor.modify(|h| h.transaction_id = 11)?;
    }
    // Revision 1 went to the second file; pretend that write was torn.
    tear(dir.path(), HEADER_FILE_NAMES[1]);

    let accessor = HeaderAccessor::new(dir.path(), PAGE_SIZE, None);
    assert!(!accessor.initialize()?);
    assert_eq!(accessor.get(|h| (h.header_revision, h.transaction_id))?, (0, 10));

    // The next write goes to the torn file and makes it authoritative again.
    accessor.modify(|h| h.transaction_id = 12)?;
    let repaired = read_header(dir.path(), HEADER_FILE_NAMES[1]).unwrap();
    assert_eq!(repaired.header_revision, 1);
    assert_eq!(repaired.transaction_id, 12);
    Ok(())
}

#[test]
fn both_files_torn_is_corruption() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    HeaderAccessor::new(dir.path(), PAGE_SIZE, None).initialize()?;
    for name in HEADER_FILE_NAMES {
        tear(dir.path(), name);
    }
    let err = HeaderAccessor::new(dir.path(), PAGE_SIZE, None)
        .initialize()
        .unwrap_err();
    assert!(matches!(err, StorageError::Corruption(_)));
    Ok(())
}

#[test]
fn disposed_accessor_rejects_every_call() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let accessor = HeaderAccessor::new(dir.path(), PAGE_SIZE, None);
    accessor.initialize()?;
    accessor.dispose();
    assert!(matches!(accessor.get(|h| h.page_size), Err(StorageError::Disposed(_))));
    assert!(matches!(accessor.modify(|_| {}), Err(StorageError::Disposed(_))));
    assert!(matches!(accessor.initialize(), Err(StorageError::Disposed(_))));
    assert!(matches!(accessor.copy_header_files(), Err(StorageError::Disposed(_))));
    assert!(matches!(accessor.dir(), Err(StorageError::Disposed(_))));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn one_file_always_holds_the_newest_revision(
        ids in proptest::collection::vec(0i64..1_000_000, 1..20),
        torn in any::<bool>(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let accessor = HeaderAccessor::new(dir.path(), PAGE_SIZE, None);
        accessor.initialize().unwrap();
        let mut last = None;
        for id in &ids {
            let header = accessor.modify(|h| h.transaction_id = *id).unwrap();
            let newest = (0..2)
                .filter_map(|i| read_header(dir.path(), HEADER_FILE_NAMES[i]))
                .map(|h| h.header_revision)
                .max()
                .unwrap();
            prop_assert_eq!(newest, header.header_revision);
            last = Some(header);
        }
        let last = last.unwrap();
        drop(accessor);

        let expected = if torn {
            // Lose the newest write; the other file must still be intact.
            tear(dir.path(), HeaderAccessor::file_for_revision(last.header_revision));
            last.header_revision - 1
        } else {
            last.header_revision
        };
        let reopened = HeaderAccessor::new(dir.path(), PAGE_SIZE, None);
        reopened.initialize().unwrap();
        prop_assert_eq!(reopened.get(|h| h.header_revision).unwrap(), expected);
        if !torn {
            prop_assert_eq!(reopened.get(|h| h.transaction_id).unwrap(), last.transaction_id);
        }
    }
}
