/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The frontier-driven operators.
//!
//! [`vertex_map`] applies a function to the data of every active vertex,
//! shard-parallel; returning `false` drops the vertex from the active set.
//!
//! [`edge_map`] walks, for every destination shard, the adjacency lists of
//! every active source, accumulating contributions into per-destination
//! [`VertexAccum`] slots private to the worker. Each worker's
//! [`ShardView`] publishes its slots through the destination shard's
//! serialized reducer, which folds them into the shard data and ORs the
//! worker's private frontier into the shard frontier. Associativity of the
//! accumulator is required for results independent of the reduction order.
//!
//! Both operators block on their task group before returning, so an
//! algorithm is a plain loop of operator calls.

use crate::graph::{Adjacency, ShardAccess};
use crate::group::{Empty, TaskGroup, View};
use crate::pool::Priority;
use crate::reduce::Sum;
use anyhow::Result;
use std::marker::PhantomData;
use std::sync::Arc;

/// A per-destination-vertex accumulator for [`edge_map`].
///
/// One slot exists per local vertex of the destination shard; the user edge
/// function folds contributions into the slot, and
/// [`fold`](VertexAccum::fold) later merges the slot into the vertex data
/// under the shard's reducer. Must be associative for deterministic results.
pub trait VertexAccum: Default + Send + 'static {
    type Data: Copy;

    fn fold(&self, data: &mut Self::Data);
}

/// The task data of an inner [`edge_map`] group: which destination shard it
/// serves, and how to reach its buffers.
pub struct ShardCtx<G: ShardAccess> {
    graph: G,
    shard: usize,
}

/// The per-worker view of an inner [`edge_map`] group: one accumulator slot
/// per destination-local vertex, plus a private frontier.
pub struct ShardView<W, G>
where
    W: VertexAccum,
    G: ShardAccess<VertexData = W::Data>,
{
    accums: Vec<W>,
    frontier: crate::bits::Bitset,
    _marker: PhantomData<fn() -> G>,
}

impl<W, G> View for ShardView<W, G>
where
    W: VertexAccum,
    G: ShardAccess<VertexData = W::Data>,
{
    type TaskData = ShardCtx<G>;

    fn new(ctx: &ShardCtx<G>) -> Self {
        let nv = ctx.graph.vertices_of_shard(ctx.shard);
        Self {
            accums: (0..nv).map(|_| W::default()).collect(),
            frontier: crate::bits::Bitset::new(nv),
            _marker: PhantomData,
        }
    }

    fn apply(self, group: &TaskGroup<Self>) {
        let ShardView {
            accums, frontier, ..
        } = self;
        group.reduce(move |ctx| {
            let data = ctx.graph.data_seq(ctx.shard)?;
            for (local, accum) in accums.iter().enumerate() {
                // SAFETY: serialized by this shard's reducer chain.
                let mut value = unsafe { data[local].get() };
                accum.fold(&mut value);
                unsafe { data[local].set(value) };
            }
            ctx.graph.frontier_seq(ctx.shard)?.or_assign(&frontier);
            Ok(())
        });
    }
}

/// Applies `f` to every active vertex of every shard, in parallel over
/// shards, accumulating into the group's per-worker views.
///
/// Per shard: the frontier is cleared, then `f` receives each active
/// vertex's data by mutable reference together with the calling worker's
/// view; returning `false` removes the vertex from the active set. Iteration
/// order within a shard is unspecified but single-threaded.
///
/// Blocks on `group` before returning.
pub fn vertex_map_with<G, W, F>(group: &Arc<TaskGroup<W>>, graph: &G, f: F) -> Result<()>
where
    G: ShardAccess,
    W: View,
    F: Fn(&mut G::VertexData, &mut W) -> bool + Send + Sync + 'static,
{
    let g = graph.clone();
    group.start(g.n_shards(), move |shard, view| {
        let frontier = g.frontier_seq(shard)?;
        frontier.clear();
        let data = g.data_seq(shard)?;
        let active = g.active_seq(shard)?;
        active.for_each(|local| {
            // SAFETY: this task is the only writer of its shard's data.
            let mut value = unsafe { data[local].get() };
            let keep = f(&mut value, view);
            unsafe { data[local].set(value) };
            if !keep {
                active.unset(local);
            }
        });
        Ok(())
    });
    graph
        .pool()
        .submit_and_join(Priority::MAX, group.clone());
    group.wait()
}

/// [`vertex_map_with`] over a viewless group.
pub fn vertex_map<G, F>(graph: &G, f: F) -> Result<()>
where
    G: ShardAccess,
    F: Fn(&mut G::VertexData) -> bool + Send + Sync + 'static,
{
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    vertex_map_with(&group, graph, move |data, _| f(data))
}

/// For every destination shard (outer, parallel) and every source shard
/// (inner, parallel, below the outer's priority), walks the adjacency lists
/// of the active sources in the destination shard's edge buffer and calls
/// `f(source_data, edge_payload, slot)` per edge; returning `true` marks the
/// destination in the next frontier.
///
/// Contributions land in worker-private [`ShardView`]s and reach the shard's
/// data and frontier only through its serialized reducer.
///
/// Blocks on `group` before returning.
pub fn edge_map_with<W, G, F>(group: &Arc<TaskGroup<Empty>>, graph: &G, f: F) -> Result<()>
where
    G: ShardAccess,
    W: VertexAccum<Data = G::VertexData>,
    F: Fn(&G::VertexData, &G::EdgePayload, &mut W) -> bool + Send + Sync + Clone + 'static,
{
    let g = graph.clone();
    group.start(g.n_shards(), move |shard, _| {
        let inner: Arc<TaskGroup<ShardView<W, G>>> = Arc::new(TaskGroup::new(ShardCtx {
            graph: g.clone(),
            shard,
        }));
        let gg = g.clone();
        let ff = f.clone();
        inner.start(g.n_shards(), move |src_shard, view| {
            let active = gg.active_seq(src_shard)?;
            let src_data = gg.data_seq(src_shard)?;
            let offsets = gg.vertex_offsets(shard)?;
            let edge_bytes = gg.edge_bytes(shard)?;
            active.for_each(|local| {
                let source = gg.global_id(src_shard, local);
                // SAFETY: sources are written only under their own shard's
                // serialization; we take a copy.
                let src = unsafe { src_data[local].get() };
                for (dst, payload) in
                    Adjacency::<G::EdgePayload>::of_source(offsets, edge_bytes, source)
                {
                    let dst = dst as usize;
                    if ff(&src, &payload, &mut view.accums[dst]) {
                        view.frontier.set(dst);
                    }
                }
            });
            Ok(())
        });
        g.pool()
            .submit_and_join(0, inner.clone());
        inner.wait()
    });
    graph
        .pool()
        .submit_and_join(Priority::MAX, group.clone());
    group.wait()
}

/// [`edge_map_with`] over a fresh outer group.
pub fn edge_map<W, G, F>(graph: &G, f: F) -> Result<()>
where
    G: ShardAccess,
    W: VertexAccum<Data = G::VertexData>,
    F: Fn(&G::VertexData, &G::EdgePayload, &mut W) -> bool + Send + Sync + Clone + 'static,
{
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    edge_map_with::<W, G, F>(&group, graph, f)
}

/// A view summing per-worker `f64` deltas into the group data; the usual
/// companion of a fixed-point driver's convergence check.
pub struct DeltaView {
    acc: f64,
}

impl View for DeltaView {
    type TaskData = Sum<f64>;

    fn new(_: &Sum<f64>) -> Self {
        Self { acc: 0.0 }
    }

    fn apply(self, group: &TaskGroup<Self>) {
        let acc = self.acc;
        group.reduce(move |total| {
            total.add(acc);
            Ok(())
        });
    }
}

impl std::ops::AddAssign<f64> for DeltaView {
    fn add_assign(&mut self, delta: f64) {
        self.acc += delta;
    }
}
