#![allow(missing_docs)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;
use voron::StorageEnvironment;

fn setup_db(manual_flush: bool) -> (TempDir, PathBuf, u64) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("db");
    let env = StorageEnvironment::open(common::options(&path).manual_flush(manual_flush))
        .expect("open store");
    common::seed_graph(&env).expect("seed graph");
    let last = env.last_committed().0;
    (dir, path, last)
}

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let config = dir.join("cli.toml");
    if !config.exists() {
        fs::write(&config, "[backup]\ncompression_level = 1\n").expect("write config");
    }
    let output = cargo_bin_cmd!("voron")
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "--no-sync"])
        .args(args)
        .output()
        .expect("run voron");
    assert!(
        output.status.success(),
        "voron {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json output")
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn header_lists_root_objects() {
    let (dir, db, last) = setup_db(false);
    let report = run_json(dir.path(), &["header", arg(&db)]);
    assert_eq!(report["header"]["transaction_id"].as_i64(), Some(last as i64));
    let names: Vec<&str> = report["root_objects"]
        .as_array()
        .expect("root objects")
        .iter()
        .filter_map(|entry| entry["name"].as_str())
        .collect();
    assert!(names.contains(&common::VERTICES));
    assert!(names.contains(&common::EDGES));
}

#[test]
fn flush_reports_the_last_transaction() {
    let (dir, db, last) = setup_db(true);
    let report = run_json(dir.path(), &["flush", arg(&db)]);
    assert_eq!(report["flushed_through"].as_u64(), Some(last));
}

#[test]
fn backup_then_restore_round_trips_the_graph() {
    let (dir, db, last) = setup_db(true);
    let archive = dir.path().join("backups").join("graph.zip");
    let backup = run_json(dir.path(), &["backup", arg(&db), arg(&archive)]);
    assert_eq!(backup["transaction_id"].as_u64(), Some(last));
    assert!(archive.is_file());

    let target = dir.path().join("restored");
    let restored = run_json(dir.path(), &["restore", arg(&archive), arg(&target)]);
    assert!(restored["bytes"].as_u64().unwrap_or(0) > 0);

    let header = run_json(dir.path(), &["header", arg(&target)]);
    assert_eq!(header["header"]["transaction_id"].as_i64(), Some(last as i64));

    let env = StorageEnvironment::open(common::options(&target)).expect("open restored");
    let (v1, v2, n1, _) = common::graph_view(&env).expect("graph view");
    assert_eq!(v1, Some(common::vertex_payload(1)));
    assert_eq!(v2, Some(common::vertex_payload(2)));
    assert_eq!(n1, vec![2]);
}

#[test]
fn compact_writes_a_new_store() {
    let (dir, db, _) = setup_db(false);
    let into = dir.path().join("compacted");
    let report = run_json(dir.path(), &["--quiet", "compact", arg(&db), "--into", arg(&into)]);
    assert!(report["entries_copied"].as_u64().unwrap_or(0) >= 3);
    assert_eq!(
        report["trees_copied"].as_u64(),
        run_json(dir.path(), &["header", arg(&db)])["root_objects"]
            .as_array()
            .map(|roots| roots.len() as u64)
    );

    let env = StorageEnvironment::open(common::options(&into)).expect("open compacted");
    let (v1, _, n1, _) = common::graph_view(&env).expect("graph view");
    assert_eq!(v1, Some(common::vertex_payload(1)));
    assert_eq!(n1, vec![2]);
}

#[test]
fn missing_store_fails_with_message() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("voron")
        .args(["header", arg(&dir.path().join("nowhere"))])
        .output()
        .expect("run voron");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr: {stderr}");
}
