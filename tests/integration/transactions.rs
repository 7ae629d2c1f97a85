#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use voron::storage::CommitParticipant;
use voron::types::RootObjectType;
use voron::{StorageEnvironment, StorageError, StorageOptions, Transaction};

fn open(dir: &std::path::Path) -> StorageEnvironment {
    StorageEnvironment::open(StorageOptions::new(dir).sync_journal(false)).unwrap()
}

#[test]
fn reader_keeps_its_snapshot() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    let mut tx = env.write_transaction()?;
    tx.create_tree("kv")?.add(b"a", b"1")?;
    tx.commit()?;

    let mut reader = env.read_transaction()?;
    let mut tx = env.write_transaction()?;
    {
        let mut kv = tx.read_tree("kv")?.unwrap();
        kv.add(b"a", b"2")?;
        kv.add(b"b", b"3")?;
    }
    tx.commit()?;

    {
        let mut kv = reader.read_tree("kv")?.unwrap();
        assert_eq!(kv.read(b"a")?, Some(b"1".to_vec()));
        assert_eq!(kv.read(b"b")?, None);
    }
    reader.dispose();

    let mut fresh = env.read_transaction()?;
    let mut kv = fresh.read_tree("kv")?.unwrap();
    assert_eq!(kv.read(b"a")?, Some(b"2".to_vec()));
    assert_eq!(kv.read(b"b")?, Some(b"3".to_vec()));
    Ok(())
}

#[test]
fn writers_are_serialized() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = Arc::new(open(dir.path()));
    let mut first = env.write_transaction()?;
    first.create_tree("counter")?.add(b"n", b"1")?;

    let waiting = Arc::new(AtomicUsize::new(0));
    let handle = {
        let env = Arc::clone(&env);
        let waiting = Arc::clone(&waiting);
        thread::spawn(move || {
            waiting.fetch_add(1, Ordering::SeqCst);
            let mut second = env.write_transaction().unwrap();
            let seen = second.read_tree("counter").unwrap().unwrap().read(b"n").unwrap();
            second.read_tree("counter").unwrap().unwrap().add(b"n", b"2").unwrap();
            second.commit().unwrap();
            seen
        })
    };
    while waiting.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(50));
    first.commit()?;
    drop(first);

    let seen = handle.join().unwrap();
    assert_eq!(seen, Some(b"1".to_vec()));
    let mut tx = env.read_transaction()?;
    assert_eq!(tx.read_tree("counter")?.unwrap().read(b"n")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn uncommitted_changes_are_discarded() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    {
        let mut tx = env.write_transaction()?;
        tx.create_tree("ghost")?.add(b"k", b"v")?;
    }
    let mut tx = env.write_transaction()?;
    tx.create_tree("kept")?.add(b"k", b"v")?;
    tx.dispose();

    let mut tx = env.read_transaction()?;
    assert!(tx.read_tree("ghost")?.is_none());
    assert!(tx.read_tree("kept")?.is_none());
    Ok(())
}

#[test]
fn rename_and_delete_update_the_root_objects() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    let mut tx = env.write_transaction()?;
    tx.create_tree("draft")?.add(b"k", b"v")?;
    tx.create_tree("other")?;
    tx.fixed_tree_for("ids", 8)?.add(7, &[7; 8])?;
    tx.commit()?;

    let mut tx = env.write_transaction()?;
    assert!(matches!(
        tx.rename_tree("draft", "other"),
        Err(StorageError::TreeExists(_))
    ));
    assert!(matches!(
        tx.rename_tree("draft", "$Root"),
        Err(StorageError::Invalid(_))
    ));
    assert!(matches!(
        tx.rename_tree("missing", "fresh"),
        Err(StorageError::NotFound(_))
    ));
    tx.rename_tree("draft", "final")?;
    assert!(tx.delete_tree("other")?);
    assert!(!tx.delete_tree("other")?);
    tx.commit()?;

    let mut tx = env.read_transaction()?;
    let roots = tx.root_objects()?;
    let names: Vec<&str> = roots.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"final"));
    assert!(!names.contains(&"draft"));
    assert!(!names.contains(&"other"));
    assert!(roots
        .iter()
        .any(|(name, kind)| name == "ids" && *kind == RootObjectType::FixedSizeTree));
    assert_eq!(tx.read_tree("final")?.unwrap().read(b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn multi_values_persist_across_commits() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    let mut tx = env.write_transaction()?;
    {
        let mut tags = tx.create_tree("tags")?;
        for value in [&b"red"[..], b"green", b"blue"] {
            tags.multi_add(b"colors", value)?;
        }
        tags.add(b"single", b"only")?;
    }
    tx.commit()?;

    let mut tx = env.write_transaction()?;
    {
        let mut tags = tx.read_tree("tags")?.unwrap();
        assert!(tags.multi_delete(b"colors", b"green")?);
        assert!(!tags.multi_delete(b"colors", b"purple")?);
        tags.multi_add(b"single", b"second")?;
    }
    tx.commit()?;

    let mut tx = env.read_transaction()?;
    let mut tags = tx.read_tree("tags")?.unwrap();
    assert_eq!(tags.multi_read(b"colors")?, vec![b"blue".to_vec(), b"red".to_vec()]);
    assert_eq!(tags.multi_read(b"single")?, vec![b"only".to_vec(), b"second".to_vec()]);
    Ok(())
}

struct Audit {
    runs: Arc<AtomicUsize>,
    wanted: bool,
}

impl CommitParticipant for Audit {
    fn requires_participation(&self) -> bool {
        self.wanted
    }

    fn prepare(&mut self, tx: &mut Transaction<'_>) -> voron::Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) as i64;
        let id = tx.id()?;
        tx.fixed_tree_for("audit", 8)?.add(run, &id.0.to_le_bytes())?;
        Ok(())
    }
}

#[test]
fn participants_write_inside_the_commit() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    let runs = Arc::new(AtomicUsize::new(0));
    let mut tx = env.write_transaction()?;
    let id = tx.id()?;
    tx.create_tree("data")?.add(b"k", b"v")?;
    tx.register(Box::new(Audit {
        runs: Arc::clone(&runs),
        wanted: true,
    }))?;
    tx.register(Box::new(Audit {
        runs: Arc::clone(&runs),
        wanted: false,
    }))?;
    tx.commit()?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let mut tx = env.read_transaction()?;
    let mut audit = tx.fixed_tree_for("audit", 8)?;
    assert_eq!(audit.read(0)?, Some(id.0.to_le_bytes().to_vec()));
    Ok(())
}

#[test]
fn disposed_transaction_rejects_calls() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    let mut tx = env.write_transaction()?;
    tx.dispose();
    tx.dispose();
    assert!(matches!(tx.create_tree("t"), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.read_tree("t"), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.fixed_tree_for("f", 8), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.root_objects(), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.commit(), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.id(), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.is_writable(), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.page_size(), Err(StorageError::Disposed(_))));
    assert!(matches!(tx.low_level(), Err(StorageError::Disposed(_))));
    Ok(())
}

#[test]
fn read_transaction_cannot_write() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let env = open(dir.path());
    let mut tx = env.read_transaction()?;
    assert!(matches!(tx.create_tree("t"), Err(StorageError::Invalid(_))));
    assert!(matches!(tx.commit(), Err(StorageError::Invalid(_))));
    Ok(())
}
