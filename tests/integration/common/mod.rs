//! Tiny graph layered on the storage API: vertices live in a fixed-size tree
//! keyed by id, adjacency in a multi-value tree keyed by source id.
#![allow(dead_code)]

use std::path::Path;

use voron::{Result, StorageEnvironment, StorageOptions, Transaction};

pub const VERTICES: &str = "vertices";
pub const EDGES: &str = "edges";
pub const VERTEX_SIZE: u16 = 16;

pub fn options(path: &Path) -> StorageOptions {
    StorageOptions::new(path).sync_journal(false)
}

pub fn vertex_payload(id: i64) -> Vec<u8> {
    let mut payload = vec![0u8; VERTEX_SIZE as usize];
    payload[..8].copy_from_slice(&id.to_le_bytes());
    payload[8..].copy_from_slice(&(id * 7919).to_le_bytes());
    payload
}

pub fn add_vertex(tx: &mut Transaction<'_>, id: i64) -> Result<()> {
    tx.fixed_tree_for(VERTICES, VERTEX_SIZE)?
        .add(id, &vertex_payload(id))?;
    Ok(())
}

pub fn add_edge(tx: &mut Transaction<'_>, src: i64, dst: i64) -> Result<()> {
    tx.create_tree(EDGES)?
        .multi_add(&src.to_be_bytes(), &dst.to_be_bytes())
}

pub fn read_vertex(tx: &mut Transaction<'_>, id: i64) -> Result<Option<Vec<u8>>> {
    tx.fixed_tree_for(VERTICES, VERTEX_SIZE)?.read(id)
}

pub fn neighbors(tx: &mut Transaction<'_>, id: i64) -> Result<Vec<i64>> {
    let Some(mut edges) = tx.read_tree(EDGES)? else {
        return Ok(Vec::new());
    };
    Ok(edges
        .multi_read(&id.to_be_bytes())?
        .into_iter()
        .map(|raw| i64::from_be_bytes(raw.as_slice().try_into().expect("8-byte vertex id")))
        .collect())
}

/// Vertices `{1, 2}` and the edge `1 -> 2`.
pub fn seed_graph(env: &StorageEnvironment) -> Result<()> {
    let mut tx = env.write_transaction()?;
    add_vertex(&mut tx, 1)?;
    add_vertex(&mut tx, 2)?;
    add_edge(&mut tx, 1, 2)?;
    tx.commit()
}

/// What a reader sees of the seeded graph.
pub fn graph_view(env: &StorageEnvironment) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, Vec<i64>, Vec<i64>)> {
    let mut tx = env.read_transaction()?;
    Ok((
        read_vertex(&mut tx, 1)?,
        read_vertex(&mut tx, 2)?,
        neighbors(&mut tx, 1)?,
        neighbors(&mut tx, 2)?,
    ))
}
