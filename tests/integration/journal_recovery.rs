#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use voron::types::journal_name;
use voron::{StorageEnvironment, StorageOptions};

fn journal_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "journal"))
        .count()
}

fn put(env: &StorageEnvironment, key: &[u8], value: &[u8]) -> voron::Result<()> {
    let mut tx = env.write_transaction()?;
    tx.create_tree("kv")?.add(key, value)?;
    tx.commit()
}

fn get(env: &StorageEnvironment, key: &[u8]) -> voron::Result<Option<Vec<u8>>> {
    let mut tx = env.read_transaction()?;
    let value = match tx.read_tree("kv")? {
        Some(mut kv) => kv.read(key)?,
        None => None,
    };
    Ok(value)
}

#[test]
fn unflushed_commits_are_replayed_on_open() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let journals = dir.path().join("journals");
    let options = || {
        StorageOptions::new(dir.path().join("db"))
            .journal_path(&journals)
            .sync_journal(false)
            .manual_flush(true)
    };

    let last = {
        let env = StorageEnvironment::open(options())?;
        for n in 0..3u8 {
            put(&env, &[b'k', n], &[n; 32])?;
        }
        assert!(env.pending_pages() > 0);
        env.last_committed()
    };
    assert!(journal_count(&journals) >= 1);

    let env = StorageEnvironment::open(options())?;
    assert_eq!(env.last_committed(), last);
    for n in 0..3u8 {
        assert_eq!(get(&env, &[b'k', n])?, Some(vec![n; 32]));
    }
    let header = env.header().header()?;
    assert_eq!(header.transaction_id, last.0 as i64);
    assert_eq!(header.journal.current_journal, -1);
    assert_eq!(journal_count(&journals), 0);
    Ok(())
}

#[test]
fn torn_record_stops_recovery() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = || {
        StorageOptions::new(dir.path())
            .sync_journal(false)
            .manual_flush(true)
    };

    let (first, journal, torn_end, page_size) = {
        let env = StorageEnvironment::open(options())?;
        put(&env, b"a", b"first")?;
        let first = env.last_committed();
        put(&env, b"b", b"second")?;
        let current = env.journal().current().unwrap();
        (
            first,
            current.number(),
            current.write_page_position(),
            env.page_size() as u64,
        )
    };

    // Flip a byte inside the last page image of the second record.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.path().join(journal_name(journal)))?;
    let at = torn_end * page_size - 16;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, at)?;
    byte[0] ^= 0xFF;
    file.write_all_at(&byte, at)?;
    drop(file);

    let env = StorageEnvironment::open(options())?;
    assert_eq!(env.last_committed(), first);
    assert_eq!(get(&env, b"a")?, Some(b"first".to_vec()));
    assert_eq!(get(&env, b"b")?, None);

    put(&env, b"c", b"third")?;
    assert!(env.current_journal().unwrap() > journal);
    assert_eq!(get(&env, b"c")?, Some(b"third".to_vec()));
    Ok(())
}

#[test]
fn flushed_records_are_not_replayed_twice() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = || StorageOptions::new(dir.path()).sync_journal(false);
    {
        let env = StorageEnvironment::open(options())?;
        put(&env, b"a", b"1")?;
        put(&env, b"a", b"2")?;
        assert_eq!(env.pending_pages(), 0);
    }
    let env = StorageEnvironment::open(options())?;
    assert_eq!(get(&env, b"a")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn rolled_journals_are_deleted_once_flushed() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = StorageEnvironment::open(
        StorageOptions::new(dir.path())
            .sync_journal(false)
            .max_log_file_size(16 * 1024)
            .initial_log_file_size(16 * 1024),
    )?;
    let first = {
        put(&env, b"k-0", &[0; 64])?;
        env.current_journal().unwrap()
    };
    for n in 1..8u8 {
        put(&env, format!("k-{n}").as_bytes(), &[n; 64])?;
    }
    assert!(env.current_journal().unwrap() > first);
    assert_eq!(journal_count(dir.path()), env.journal_files().len());
    assert!(!dir.path().join(journal_name(first)).exists());
    Ok(())
}

#[test]
fn incremental_backup_keeps_retired_journals() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = || {
        StorageOptions::new(dir.path())
            .sync_journal(false)
            .incremental_backup(true)
            .max_log_file_size(16 * 1024)
            .initial_log_file_size(16 * 1024)
    };
    let last_created = {
        let env = StorageEnvironment::open(options())?;
        for n in 0..8u8 {
            put(&env, format!("k-{n}").as_bytes(), &[n; 64])?;
        }
        let last_created = env.journal().last_created().unwrap();
        assert!(journal_count(dir.path()) > env.journal_files().len());
        let header = env.header().header()?;
        assert_eq!(header.incremental_backup.last_created_journal, last_created as i64);
        last_created
    };

    let env = StorageEnvironment::open(options())?;
    for number in 0..=last_created {
        assert!(dir.path().join(journal_name(number)).exists());
    }
    put(&env, b"after", b"reopen")?;
    assert!(env.current_journal().unwrap() > last_created);
    Ok(())
}
