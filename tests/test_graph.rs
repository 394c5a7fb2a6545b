/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use shardgraph::graph::edge_file::EdgeFile;
use shardgraph::graph::partition::{DefaultHash, ShardHash};
use shardgraph::graph::{edge_record_size, Adjacency, Edge, Graph, ShardAccess, WeightedEdge};

fn small_edges() -> Vec<Edge> {
    [(0, 1), (0, 3), (1, 3), (2, 1)]
        .into_iter()
        .map(|(from, to)| Edge { from, to })
        .collect()
}

#[test]
fn test_partition_closure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let hash = DefaultHash::new(2);
    let graph: Graph<u64> = Graph::with_spill_dir(2, 4, hash.clone(), dir.path())?;
    graph.ingest(small_edges())?;

    // Every inserted edge shows up exactly once, in the shard of its
    // destination, in the adjacency list of its source.
    for Edge { from, to } in small_edges() {
        let (shard, local) = hash.hash(to);
        let offsets = graph.vertex_offsets(shard)?;
        let edge_bytes = graph.edge_bytes(shard)?;
        let hits = Adjacency::<()>::of_source(offsets, edge_bytes, from)
            .filter(|&(dst, _)| dst == local)
            .count();
        assert_eq!(hits, 1, "edge ({from}, {to}) not stored exactly once");
    }
    Ok(())
}

#[test]
fn test_offset_monotonicity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<u64> = Graph::with_spill_dir(2, 4, DefaultHash::new(2), dir.path())?;
    graph.ingest(small_edges())?;

    for shard in 0..graph.n_shards() {
        let offsets = graph.vertex_offsets(shard)?;
        let edge_len = graph.edge_bytes(shard)?.len() as u64;
        for window in offsets.windows(2) {
            assert!(window[0] <= window[1]);
        }
        if let Some(&last) = offsets.last() {
            assert!(last <= edge_len);
        }
    }
    Ok(())
}

#[test]
fn test_shard_balance_ring() -> Result<()> {
    // A 24-cycle over 24 shards stores exactly one incoming edge per shard.
    let dir = tempfile::tempdir()?;
    let n = 24;
    let edges = (0..n).map(|i| Edge {
        from: i,
        to: (i + 1) % n,
    });
    let graph: Graph<u64> =
        Graph::with_spill_dir(n as usize, n as usize, DefaultHash::new(n as usize), dir.path())?;
    graph.ingest(edges)?;
    for shard in 0..graph.n_shards() {
        assert_eq!(graph.edges_of_shard(shard), 1);
        assert_eq!(graph.edge_bytes(shard)?.len(), edge_record_size::<()>());
    }
    Ok(())
}

#[test]
fn test_unsorted_sources_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<u64> = Graph::with_spill_dir(1, 4, DefaultHash::new(1), dir.path())?;
    let out_of_order = [(3, 0), (1, 0)].map(|(from, to)| Edge { from, to });
    assert!(graph.ingest(out_of_order).is_err());
    Ok(())
}

#[test]
fn test_ingest_after_freeze_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<u64> = Graph::with_spill_dir(1, 4, DefaultHash::new(1), dir.path())?;
    graph.ingest(small_edges())?;
    // Reading the shard freezes its buffers.
    let _ = graph.edge_bytes(0)?;
    assert!(graph
        .put_edge(0, 0, &Edge { from: 3, to: 0 })
        .is_err());
    Ok(())
}

#[test]
fn test_weighted_payloads() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let n = 8u64;
    let edges = (0..n).map(|i| WeightedEdge {
        from: i,
        to: (i + 1) % n,
        weight: i as u32,
    });
    let hash = DefaultHash::new(2);
    let graph: Graph<u64, u32> = Graph::with_spill_dir(2, n as usize, hash.clone(), dir.path())?;
    graph.ingest(edges)?;

    for i in 0..n {
        let to = (i + 1) % n;
        let (shard, local) = hash.hash(to);
        let offsets = graph.vertex_offsets(shard)?;
        let edge_bytes = graph.edge_bytes(shard)?;
        let list: Vec<_> = Adjacency::<u32>::of_source(offsets, edge_bytes, i).collect();
        assert_eq!(list, vec![(local, i as u32)]);
    }
    Ok(())
}

#[test]
fn test_edge_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("edges");
    let edges = small_edges();
    let mut bytes = Vec::new();
    for Edge { from, to } in &edges {
        bytes.extend_from_slice(&from.to_ne_bytes());
        bytes.extend_from_slice(&to.to_ne_bytes());
    }
    std::fs::write(&path, &bytes)?;

    let edge_file = EdgeFile::<Edge>::open(&path)?;
    assert_eq!(edge_file.len(), edges.len());
    for (read, expected) in edge_file.iter().zip(&edges) {
        assert_eq!(read.from, expected.from);
        assert_eq!(read.to, expected.to);
    }

    // An edge file feeds ingestion directly.
    let graph: Graph<u64> = Graph::with_spill_dir(2, 4, DefaultHash::new(2), dir.path())?;
    graph.ingest(edge_file.iter())?;
    assert_eq!(
        (0..2).map(|s| graph.edges_of_shard(s)).sum::<usize>(),
        edges.len()
    );
    Ok(())
}

#[test]
fn test_edge_file_truncated_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("edges");
    std::fs::write(&path, [0u8; 17])?;
    assert!(EdgeFile::<Edge>::open(&path).is_err());
    Ok(())
}

#[test]
fn test_vertices_of_shard() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<u64> = Graph::with_spill_dir(3, 10, DefaultHash::new(3), dir.path())?;
    assert_eq!(graph.vertices_of_shard(0), 4);
    assert_eq!(graph.vertices_of_shard(1), 3);
    assert_eq!(graph.vertices_of_shard(2), 3);
    assert_eq!(graph.n_vertices(), 10);
    Ok(())
}
