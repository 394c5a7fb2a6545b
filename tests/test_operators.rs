/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use shardgraph::buffer::PlainData;
use shardgraph::graph::partition::DefaultHash;
use shardgraph::graph::{Edge, Graph, ShardAccess};
use shardgraph::ops::{edge_map, vertex_map, VertexAccum};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
struct Val {
    curr: f64,
    next: f64,
    out_degree: u64,
}

unsafe impl PlainData for Val {}

#[derive(Default)]
struct PushAccum(f64);

impl VertexAccum for PushAccum {
    type Data = Val;

    fn fold(&self, data: &mut Val) {
        data.next += self.0;
    }
}

fn collect_data(graph: &Graph<Val>) -> Result<Vec<(u64, Val)>> {
    let mut all = Vec::new();
    for shard in 0..graph.n_shards() {
        let data = graph.data_seq(shard)?;
        for (local, cell) in data.iter().enumerate() {
            // SAFETY: no group is running.
            all.push((graph.global_id(shard, local), unsafe { cell.get() }));
        }
    }
    all.sort_by_key(|&(v, _)| v);
    Ok(all)
}

/// An empty graph: `vertex_map` touches every vertex, `edge_map` none.
#[test]
fn test_empty_graph() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<Val> = Graph::with_spill_dir(2, 10, DefaultHash::new(2), dir.path())?;
    graph.active_all()?;
    vertex_map(&graph, |v: &mut Val| {
        v.curr = 1.0;
        true
    })?;
    for (_, val) in collect_data(&graph)? {
        assert_eq!(val.curr, 1.0);
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    edge_map::<PushAccum, _, _>(&graph, move |_, _, _| {
        c.fetch_add(1, Ordering::Relaxed);
        true
    })?;
    assert_eq!(calls.load(Ordering::Relaxed), 0);
    Ok(())
}

/// A single self-loop: one push lands the full rank share on the vertex.
#[test]
fn test_self_loop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<Val> = Graph::with_spill_dir(1, 1, DefaultHash::new(1), dir.path())?;
    graph.ingest([Edge { from: 0, to: 0 }])?;
    graph.fill_vertex_data(|_| Val {
        curr: 1.0,
        next: 0.0,
        out_degree: 1,
    })?;
    graph.active_all()?;
    edge_map::<PushAccum, _, _>(&graph, |src, _, accum| {
        accum.0 += src.curr / src.out_degree as f64;
        true
    })?;
    let data = collect_data(&graph)?;
    assert_eq!(data[0].1.next, 1.0);
    Ok(())
}

/// A filter that drops everything empties the active set; the next
/// `edge_map` performs zero user-function calls.
#[test]
fn test_frontier_narrowing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<Val> = Graph::with_spill_dir(2, 8, DefaultHash::new(2), dir.path())?;
    let edges = (0..8).map(|i| Edge {
        from: i,
        to: (i + 3) % 8,
    });
    // Destination order is scrambled but sources stay sorted per shard.
    graph.ingest(edges)?;
    graph.fill_vertex_data(|_| Val {
        curr: 1.0,
        next: 0.0,
        out_degree: 1,
    })?;
    graph.active_all()?;

    vertex_map(&graph, |_: &mut Val| false)?;
    for shard in 0..graph.n_shards() {
        assert_eq!(graph.active_seq(shard)?.count(), 0);
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    edge_map::<PushAccum, _, _>(&graph, move |_, _, _| {
        c.fetch_add(1, Ordering::Relaxed);
        true
    })?;
    assert_eq!(calls.load(Ordering::Relaxed), 0);
    Ok(())
}

/// `edge_map` fills the frontier with the touched destinations;
/// `adopt_frontier` turns it into the next active set.
#[test]
fn test_frontier_adoption() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let n = 9u64;
    let graph: Graph<Val> = Graph::with_spill_dir(3, n as usize, DefaultHash::new(3), dir.path())?;
    // A star: vertex 0 points at 1..4.
    let edges = (1..5).map(|to| Edge { from: 0, to });
    graph.ingest(edges)?;
    graph.fill_vertex_data(|v| Val {
        curr: 0.0,
        next: 0.0,
        out_degree: u64::from(v == 0) * 4,
    })?;
    graph.active_all()?;

    edge_map::<PushAccum, _, _>(&graph, |src, _, accum| {
        accum.0 += src.curr;
        true
    })?;
    graph.adopt_frontier()?;

    let active: usize = (0..graph.n_shards())
        .map(|s| graph.active_seq(s).unwrap().count())
        .sum();
    assert_eq!(active, 4);
    for shard in 0..graph.n_shards() {
        let active = graph.active_seq(shard)?;
        active.for_each(|local| {
            let v = graph.global_id(shard, local);
            assert!((1..5).contains(&v), "vertex {v} wrongly in the frontier");
        });
    }
    Ok(())
}

/// The filter's writes land even when it returns `false`.
#[test]
fn test_vertex_map_writes_on_false() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph: Graph<Val> = Graph::with_spill_dir(2, 4, DefaultHash::new(2), dir.path())?;
    graph.active_all()?;
    vertex_map(&graph, |v: &mut Val| {
        v.curr = 7.0;
        false
    })?;
    for (_, val) in collect_data(&graph)? {
        assert_eq!(val.curr, 7.0);
    }
    Ok(())
}
