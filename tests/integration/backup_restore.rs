#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::{add_vertex, graph_view, options, read_vertex, seed_graph};
use voron::admin::{restore, BackupOptions, FullBackup};
use voron::StorageEnvironment;

#[test]
fn restored_graph_matches_journaled_source() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = StorageEnvironment::open(options(&dir.path().join("db")).manual_flush(true))?;
    seed_graph(&env)?;
    assert!(env.pending_pages() > 0);

    let archive = dir.path().join("backup.zip");
    let report = FullBackup::new(BackupOptions::default())
        .execute(&env, &archive)
        .unwrap();
    assert!(!report.journals.is_empty());

    let target = dir.path().join("restored");
    restore(&archive, &target, None).unwrap();
    let restored = StorageEnvironment::open(options(&target))?;
    assert_eq!(restored.last_committed().0, report.transaction_id);
    assert_eq!(graph_view(&restored)?, graph_view(&env)?);
    Ok(())
}

#[test]
fn restored_graph_matches_flushed_source() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = StorageEnvironment::open(options(&dir.path().join("db")))?;
    seed_graph(&env)?;
    assert_eq!(env.pending_pages(), 0);

    let archive = dir.path().join("backup.zip");
    let report = FullBackup::new(BackupOptions { compression_level: 0 })
        .execute(&env, &archive)
        .unwrap();
    assert_eq!(report.data_bytes, report.allocated_pages * env.page_size() as u64);

    let target = dir.path().join("restored");
    restore(&archive, &target, None).unwrap();
    let restored = StorageEnvironment::open(options(&target))?;
    let (v1, v2, n1, n2) = graph_view(&restored)?;
    assert_eq!(v1, Some(common::vertex_payload(1)));
    assert_eq!(v2, Some(common::vertex_payload(2)));
    assert_eq!(n1, vec![2]);
    assert!(n2.is_empty());
    Ok(())
}

#[test]
fn journals_restore_into_a_separate_directory() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = StorageEnvironment::open(options(&dir.path().join("db")).manual_flush(true))?;
    seed_graph(&env)?;
    let archive = dir.path().join("backup.zip");
    FullBackup::new(BackupOptions::default())
        .execute(&env, &archive)
        .unwrap();

    let data_dir = dir.path().join("restored");
    let journal_dir = dir.path().join("restored-journals");
    let report = restore(&archive, &data_dir, Some(&journal_dir)).unwrap();
    assert!(!report.journal_files.is_empty());

    let restored = StorageEnvironment::open(options(&data_dir).journal_path(&journal_dir))?;
    assert_eq!(graph_view(&restored)?, graph_view(&env)?);
    Ok(())
}

#[test]
fn commits_after_the_backup_are_not_restored() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = StorageEnvironment::open(options(&dir.path().join("db")).manual_flush(true))?;
    seed_graph(&env)?;
    let archive = dir.path().join("backup.zip");
    FullBackup::new(BackupOptions::default())
        .execute(&env, &archive)
        .unwrap();

    let mut tx = env.write_transaction()?;
    add_vertex(&mut tx, 3)?;
    tx.commit()?;

    let target = dir.path().join("restored");
    restore(&archive, &target, None).unwrap();
    let restored = StorageEnvironment::open(options(&target))?;
    let mut tx = restored.read_transaction()?;
    assert!(read_vertex(&mut tx, 1)?.is_some());
    assert_eq!(read_vertex(&mut tx, 3)?, None);
    Ok(())
}

#[test]
fn backup_under_concurrent_writes_restores_a_prefix() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = Arc::new(StorageEnvironment::open(options(&dir.path().join("db")))?);
    seed_graph(&env)?;

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let env = Arc::clone(&env);
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> voron::Result<i64> {
            let mut next = 10;
            while !stop.load(Ordering::Acquire) && next < 400 {
                let mut tx = env.write_transaction()?;
                add_vertex(&mut tx, next)?;
                tx.commit()?;
                next += 1;
            }
            Ok(next)
        })
    };

    let archive = dir.path().join("backup.zip");
    let report = FullBackup::new(BackupOptions::default())
        .execute(&env, &archive)
        .unwrap();
    stop.store(true, Ordering::Release);
    let written = writer.join().unwrap()?;

    let target = dir.path().join("restored");
    restore(&archive, &target, None).unwrap();
    let restored = StorageEnvironment::open(options(&target))?;
    assert_eq!(restored.last_committed().0, report.transaction_id);

    let mut tx = restored.read_transaction()?;
    assert!(read_vertex(&mut tx, 1)?.is_some());
    let mut present = true;
    for id in 10..written {
        let found = read_vertex(&mut tx, id)?.is_some();
        assert!(present || !found, "vertex {id} restored after a gap");
        present = found;
    }
    Ok(())
}
