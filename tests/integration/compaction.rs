#![allow(missing_docs)]

mod common;

use std::path::Path;

use common::{add_edge, add_vertex, graph_view, options, seed_graph};
use voron::admin::{AdminError, CompactionProgress, StorageCompaction};
use voron::types::RootObjectType;
use voron::StorageEnvironment;

fn churned_store(path: &Path) -> voron::Result<()> {
    let env = StorageEnvironment::open(options(path))?;
    seed_graph(&env)?;
    let mut tx = env.write_transaction()?;
    {
        let mut docs = tx.create_tree("docs")?;
        for n in 0..600u32 {
            docs.add(format!("doc/{n:05}").as_bytes(), &[n as u8; 96])?;
        }
    }
    for id in 3..200 {
        add_vertex(&mut tx, id)?;
        add_edge(&mut tx, 1, id)?;
    }
    {
        let mut docs = tx.create_tree("docs")?;
        let mut embedded = docs.fixed_tree_for(b"counters", 8)?;
        for n in 0..40i64 {
            embedded.add(n, &(n * n).to_le_bytes())?;
        }
    }
    tx.commit()?;

    let mut tx = env.write_transaction()?;
    {
        let mut docs = tx.read_tree("docs")?.unwrap();
        for n in 0..500u32 {
            docs.delete(format!("doc/{n:05}").as_bytes())?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn compaction(src: &Path, dst: &Path) -> StorageCompaction {
    StorageCompaction::new(options(src), options(dst))
}

#[test]
fn compacted_store_holds_every_tree() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    churned_store(&src)?;

    let report = compaction(&src, &dst).execute(None).unwrap();
    assert!(report.destination_bytes <= report.source_bytes);
    assert!(report.sub_transactions >= 3);

    let source = StorageEnvironment::open(options(&src))?;
    let compacted = StorageEnvironment::open(options(&dst))?;
    assert_eq!(graph_view(&compacted)?, graph_view(&source)?);
    assert!(compacted.journal_files().is_empty());

    let mut tx = compacted.read_transaction()?;
    let roots = tx.root_objects()?;
    assert!(roots.contains(&("docs".to_string(), RootObjectType::VariableSizeTree)));
    assert!(roots.contains(&(common::VERTICES.to_string(), RootObjectType::FixedSizeTree)));
    {
        let mut docs = tx.read_tree("docs")?.unwrap();
        assert_eq!(docs.read(b"doc/00499")?, None);
        assert_eq!(docs.read(b"doc/00500")?, Some(vec![244u8; 96]));
        let mut counters = docs.fixed_tree_for(b"counters", 8)?;
        assert_eq!(counters.number_of_entries()?, 40);
        assert_eq!(counters.read(7)?, Some(49i64.to_le_bytes().to_vec()));
    }
    assert_eq!(tx.fixed_tree_for(common::VERTICES, common::VERTEX_SIZE)?.number_of_entries()?, 199);
    let mut edges = tx.read_tree(common::EDGES)?.unwrap();
    assert_eq!(edges.multi_read(&1i64.to_be_bytes())?.len(), 198);
    Ok(())
}

#[test]
fn compacting_twice_copies_the_same_entries() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    churned_store(&src)?;

    let once = compaction(&src, &first).execute(None).unwrap();
    let twice = compaction(&first, &second).execute(None).unwrap();
    assert_eq!(once.entries_copied, twice.entries_copied);
    // Freed pages are not carried over, so only the source has a free-space tree.
    assert!(twice.trees_copied <= once.trees_copied);
    assert!(twice.destination_bytes <= once.source_bytes);
    Ok(())
}

#[test]
fn progress_reports_every_root_object() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    churned_store(&src)?;

    let mut updates: Vec<CompactionProgress> = Vec::new();
    let mut record = |progress: &CompactionProgress| updates.push(progress.clone());
    let report = compaction(&src, &dir.path().join("dst"))
        .execute(Some(&mut record))
        .unwrap();

    let last = updates.last().unwrap();
    assert_eq!(last.copied_trees, last.total_trees);
    assert_eq!(report.trees_copied, last.total_trees);
    assert!(updates
        .windows(2)
        .all(|pair| pair[0].copied_trees <= pair[1].copied_trees));
    let docs_done = updates
        .iter()
        .filter(|update| update.tree == "docs")
        .last()
        .unwrap();
    assert_eq!(docs_done.copied_entries, docs_done.total_entries);
    Ok(())
}

#[test]
fn existing_destination_is_refused() -> voron::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    churned_store(&src)?;
    drop(StorageEnvironment::open(options(&dst))?);

    let err = compaction(&src, &dst).execute(None).unwrap_err();
    assert!(matches!(err, AdminError::Message(_)));

    let err = compaction(&src, &src).execute(None).unwrap_err();
    assert!(matches!(err, AdminError::Message(_)));

    let err = compaction(&dir.path().join("missing"), &dir.path().join("out"))
        .execute(None)
        .unwrap_err();
    assert!(matches!(err, AdminError::MissingDatabase(_)));
    Ok(())
}
