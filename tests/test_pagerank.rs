/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use shardgraph::buffer::PlainData;
use shardgraph::graph::partition::DefaultHash;
use shardgraph::graph::{Edge, Graph, ShardAccess};
use shardgraph::group::TaskGroup;
use shardgraph::ops::{edge_map, vertex_map_with, DeltaView, VertexAccum};
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct Rank {
    curr: f64,
    next: f64,
    out_degree: u64,
}

unsafe impl PlainData for Rank {}

#[derive(Default)]
struct RankAccum(f64);

impl VertexAccum for RankAccum {
    type Data = Rank;

    fn fold(&self, data: &mut Rank) {
        data.next += self.0;
    }
}

const DAMPING: f64 = 0.85;
const EPSILON: f64 = 1E-7;

/// Runs the fixed-point loop; returns the rank vector and the iteration
/// count.
fn pagerank(graph: &Graph<Rank>, max_iters: usize) -> Result<(Vec<f64>, usize)> {
    let n = graph.n_vertices();
    let teleport = (1.0 - DAMPING) / n as f64;
    graph.active_all()?;
    let mut iterations = 0;
    for _ in 0..max_iters {
        edge_map::<RankAccum, _, _>(graph, |src, _, accum| {
            accum.0 += src.curr / src.out_degree as f64;
            true
        })?;
        let delta = Arc::new(TaskGroup::<DeltaView>::default());
        vertex_map_with(&delta, graph, move |v, view| {
            let next = v.next * DAMPING + teleport;
            *view += (next - v.curr).abs();
            v.curr = next;
            v.next = 0.0;
            true
        })?;
        iterations += 1;
        if delta.data().get() < EPSILON {
            break;
        }
    }

    let mut ranks = vec![0.0; n];
    for shard in 0..graph.n_shards() {
        let data = graph.data_seq(shard)?;
        for (local, cell) in data.iter().enumerate() {
            // SAFETY: no group is running.
            ranks[graph.global_id(shard, local) as usize] = unsafe { cell.get() }.curr;
        }
    }
    Ok((ranks, iterations))
}

fn build(
    shards: usize,
    n: usize,
    edges: impl IntoIterator<Item = Edge>,
    dir: &std::path::Path,
) -> Result<Graph<Rank>> {
    let graph: Graph<Rank> = Graph::with_spill_dir(shards, n, DefaultHash::new(shards), dir)?;
    let mut out_degrees = vec![0u64; n];
    let edges: Vec<_> = edges.into_iter().collect();
    for e in &edges {
        out_degrees[e.from as usize] += 1;
    }
    graph.ingest(edges)?;
    graph.fill_vertex_data(move |v| Rank {
        curr: 1.0 / n as f64,
        next: 0.0,
        out_degree: out_degrees[v as usize],
    })?;
    Ok(graph)
}

/// Four vertices, two shards, a dangling node: the ranks must reach the
/// fixed point of `r = damping * sum(in) + teleport` with dangling mass
/// contributing only through the teleport term.
#[test]
fn test_four_vertices() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let edges = [(0, 1), (0, 3), (1, 3), (2, 1)].map(|(from, to)| Edge { from, to });
    let graph = build(2, 4, edges, dir.path())?;
    let (ranks, iterations) = pagerank(&graph, 50)?;

    assert!(iterations < 50, "did not converge in 50 iterations");
    let expected = [0.0375, 0.0853125, 0.0375, 0.125953125];
    for (v, (&rank, &expected)) in ranks.iter().zip(expected.iter()).enumerate() {
        assert!(
            (rank - expected).abs() < 1E-6,
            "vertex {v}: rank {rank} != {expected}"
        );
    }
    Ok(())
}

/// On a cycle every vertex ends up with the uniform rank.
#[test]
fn test_ring_uniform() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let n = 12u64;
    let edges = (0..n).map(|i| Edge {
        from: i,
        to: (i + 1) % n,
    });
    let graph = build(3, n as usize, edges, dir.path())?;
    let (ranks, _) = pagerank(&graph, 200)?;

    for (v, &rank) in ranks.iter().enumerate() {
        assert!(
            (rank - 1.0 / n as f64).abs() < 1E-6,
            "vertex {v}: rank {rank} not uniform"
        );
    }
    assert!((ranks.iter().sum::<f64>() - 1.0).abs() < 1E-5);
    Ok(())
}
