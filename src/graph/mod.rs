/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The sharded graph store.
//!
//! A [`Graph`] owns, per shard, five [`FileBuffer`]s:
//!
//! - `edges`: `(u32 local_offset, payload)` records, grouped by source
//!   vertex;
//! - `vertices`: one `u64` byte-offset into `edges` per *global* source id,
//!   padded so that the adjacency list of source `v` spans
//!   `[vertices[v], vertices[v + 1])` (the last list is bounded by the edge
//!   buffer length, and sources beyond the padded range have empty lists);
//! - `data`: the per-vertex algorithm payload;
//! - `active`: the bitset of vertices participating this iteration;
//! - `frontiers`: the bitset [`edge_map`](crate::ops::edge_map) fills with
//!   the next iteration's active set.
//!
//! Edges are placed in the shard owning their destination (pull-style
//! partitioning) and must arrive sorted by source within each shard during
//! ingestion; the offset-padding protocol relies on it.
//!
//! A `Graph` is a cheap handle (the shard buffers sit behind an [`Arc`]), so
//! shard tasks clone it freely.

pub mod edge_file;
pub mod partition;

use crate::bits::{Bitset, BitsetView};
use crate::buffer::{FileBuffer, PlainData};
use crate::group::{Empty, TaskGroup, View};
use crate::pool::{default_pool, Priority, ThreadPool};
use anyhow::{ensure, Context, Result};
use dsi_progress_logger::*;
use partition::{DefaultHash, ShardHash};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use sync_cell_slice::SyncCell;

/// An edge usable for ingestion: a source, a destination, and a fixed-size
/// payload persisted next to the destination's local offset.
pub trait EdgeRecord: PlainData {
    type Payload: PlainData;

    fn source(&self) -> u64;
    fn target(&self) -> u64;
    fn payload(&self) -> Self::Payload;
}

/// An unlabeled edge.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Edge {
    pub from: u64,
    pub to: u64,
}

unsafe impl PlainData for Edge {}

impl EdgeRecord for Edge {
    type Payload = ();

    fn source(&self) -> u64 {
        self.from
    }

    fn target(&self) -> u64 {
        self.to
    }

    fn payload(&self) {}
}

/// An edge carrying a fixed-size weight.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WeightedEdge<W: PlainData> {
    pub from: u64,
    pub to: u64,
    pub weight: W,
}

unsafe impl<W: PlainData> PlainData for WeightedEdge<W> {}

impl<W: PlainData> EdgeRecord for WeightedEdge<W> {
    type Payload = W;

    fn source(&self) -> u64 {
        self.from
    }

    fn target(&self) -> u64 {
        self.to
    }

    fn payload(&self) -> W {
        self.weight
    }
}

/// Typed access to shard storage, the surface the
/// [operators](crate::ops) are written against.
///
/// The locking discipline behind the `&`-based accessors: a shard's `data`
/// is written either by the single task owning the shard (in a vertex map)
/// or inside the shard's serialized reducer (in an edge map); `active` is
/// written by the owning task only; `frontiers` by the owning task and the
/// serialized reducer. Everything else is read-only after ingestion.
pub trait ShardAccess: Clone + Send + Sync + 'static {
    type VertexData: PlainData;
    type EdgePayload: PlainData;

    fn n_shards(&self) -> usize;
    fn n_vertices(&self) -> usize;
    fn vertices_of_shard(&self, shard: usize) -> usize;
    /// The global id of a shard-local vertex.
    fn global_id(&self, shard: usize, local: usize) -> u64;
    fn pool(&self) -> &'static ThreadPool;

    fn data_seq(&self, shard: usize) -> Result<&[SyncCell<Self::VertexData>]>;
    fn active_seq(&self, shard: usize) -> Result<BitsetView<'_>>;
    fn frontier_seq(&self, shard: usize) -> Result<BitsetView<'_>>;
    /// The per-source byte offsets into [`edge_bytes`](Self::edge_bytes).
    fn vertex_offsets(&self, shard: usize) -> Result<&[u64]>;
    fn edge_bytes(&self, shard: usize) -> Result<&[u8]>;
}

struct Shards {
    edges: Vec<FileBuffer>,
    vertices: Vec<FileBuffer>,
    data: Vec<FileBuffer>,
    active: Vec<FileBuffer>,
    frontiers: Vec<FileBuffer>,
}

struct Inner<V: PlainData, P: PlainData, H: ShardHash> {
    n_shards: usize,
    n_vertices: usize,
    hash: H,
    pool: &'static ThreadPool,
    shards: Shards,
    _marker: PhantomData<fn() -> (V, P)>,
}

/// A sharded graph with vertex data `V` and edge payload `P`, partitioned by
/// `H`.
pub struct Graph<V: PlainData, P: PlainData = (), H: ShardHash = DefaultHash> {
    inner: Arc<Inner<V, P, H>>,
}

impl<V: PlainData, P: PlainData, H: ShardHash> Clone for Graph<V, P, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: PlainData, P: PlainData, H: ShardHash> Graph<V, P, H> {
    /// Creates an empty graph spilling shard files into the current
    /// directory.
    pub fn new(shards: usize, n_vertices: usize, hash: H) -> Result<Self> {
        Self::with_spill_dir(shards, n_vertices, hash, ".")
    }

    /// Creates an empty graph spilling shard files into `spill_dir`.
    ///
    /// Sizes the vertex-data buffers and initializes the active and frontier
    /// bitsets of every shard, all cleared.
    pub fn with_spill_dir(
        shards: usize,
        n_vertices: usize,
        hash: H,
        spill_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        ensure!(shards > 0, "the graph needs at least one shard");
        let spill_dir = spill_dir.into();
        let buffers = || {
            (0..shards)
                .map(|_| FileBuffer::in_dir(spill_dir.clone()))
                .collect::<Vec<_>>()
        };
        let graph = Self {
            inner: Arc::new(Inner {
                n_shards: shards,
                n_vertices,
                hash,
                pool: default_pool(),
                shards: Shards {
                    edges: buffers(),
                    vertices: buffers(),
                    data: buffers(),
                    active: buffers(),
                    frontiers: buffers(),
                },
                _marker: PhantomData,
            }),
        };
        for shard in 0..shards {
            let nv = graph.vertices_of_shard(shard);
            let inner = &graph.inner.shards;
            inner.data[shard]
                .resize(nv * std::mem::size_of::<V>())
                .with_context(|| format!("sizing vertex data of shard {shard}"))?;
            let bitset_bytes = Bitset::allocate_size(nv);
            for buffer in [&inner.active[shard], &inner.frontiers[shard]] {
                buffer
                    .resize(bitset_bytes)
                    .with_context(|| format!("sizing bitsets of shard {shard}"))?;
                BitsetView::init(buffer.as_sync_slice::<u64>()?, nv);
            }
        }
        Ok(graph)
    }

    /// Streams edges into the store through the partitioner.
    ///
    /// Within each shard, edges must arrive sorted by source.
    pub fn ingest<E: EdgeRecord<Payload = P>>(
        &self,
        edges: impl IntoIterator<Item = E>,
    ) -> Result<()> {
        let mut pl = ProgressLogger::default();
        pl.item_name("edge").display_memory(true);
        pl.start("Ingesting edges...");
        for edge in edges {
            let (shard, local) = self.inner.hash.hash(edge.target());
            self.put_edge(shard, local, &edge)?;
            pl.light_update();
        }
        pl.done();
        Ok(())
    }

    /// Appends one edge record to `shard`.
    ///
    /// Pads the shard's vertex-offset array with the current edge-buffer
    /// length until it covers the edge's source, then appends the
    /// `(local_offset, payload)` record.
    pub fn put_edge<E: EdgeRecord<Payload = P>>(
        &self,
        shard: usize,
        local_offset: u32,
        edge: &E,
    ) -> Result<()> {
        let vertices = &self.inner.shards.vertices[shard];
        let edges = &self.inner.shards.edges[shard];
        let from = edge.source();
        let mut vid = (vertices.len() / std::mem::size_of::<u64>()) as u64;
        ensure!(
            vid == 0 || from + 1 >= vid,
            "edges of shard {shard} not sorted by source: {from} after {}",
            vid - 1
        );
        let cur = (edges.len() as u64).to_ne_bytes();
        while vid <= from {
            vertices.write(&cur)?;
            vid += 1;
        }
        edges.write(&local_offset.to_ne_bytes())?;
        edges.write(plain_bytes(&edge.payload()))?;
        Ok(())
    }

    /// Starts `group` over all shards and hands it to the pool.
    ///
    /// Called from a pool worker, the submission also participates inline;
    /// the caller is expected to [`wait`](TaskGroup::wait) on the group.
    pub fn parallel_shards<W, F>(&self, priority: Priority, group: &Arc<TaskGroup<W>>, task: F)
    where
        W: View,
        F: Fn(usize, &mut W) -> Result<()> + Send + Sync + 'static,
    {
        group.start(self.inner.n_shards, task);
        self.inner
            .pool
            .submit_and_join(priority, group.clone());
    }

    /// Runs `task` once per shard on the pool and waits.
    pub fn for_each_shard<F>(&self, task: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Send + Sync + 'static,
    {
        let group = Arc::new(TaskGroup::<Empty>::new(()));
        self.parallel_shards(Priority::MAX, &group, move |shard, _| task(shard));
        group.wait()
    }

    /// Sets every bit of every shard's active set.
    pub fn active_all(&self) -> Result<()> {
        let g = self.clone();
        self.for_each_shard(move |shard| {
            g.active_seq(shard)?.set_all();
            Ok(())
        })
    }

    /// Adopts the frontiers filled by the last
    /// [`edge_map`](crate::ops::edge_map) as the active sets of the next
    /// iteration.
    pub fn adopt_frontier(&self) -> Result<()> {
        let g = self.clone();
        self.for_each_shard(move |shard| {
            let active = g.active_seq(shard)?;
            let frontier = g.frontier_seq(shard)?;
            active.copy_from(&frontier);
            Ok(())
        })
    }

    /// Initializes every vertex's data from its global id, shard-parallel.
    pub fn fill_vertex_data<F>(&self, init: F) -> Result<()>
    where
        F: Fn(u64) -> V + Send + Sync + 'static,
    {
        let g = self.clone();
        self.for_each_shard(move |shard| {
            let data = g.data_seq(shard)?;
            for (local, cell) in data.iter().enumerate() {
                // SAFETY: this task is the only writer of its shard.
                unsafe { cell.set(init(g.global_id(shard, local))) };
            }
            Ok(())
        })
    }

    /// The number of edges stored in `shard`, from the record size.
    pub fn edges_of_shard(&self, shard: usize) -> usize {
        self.inner.shards.edges[shard].len() / edge_record_size::<P>()
    }
}

impl<V: PlainData, P: PlainData, H: ShardHash> ShardAccess for Graph<V, P, H> {
    type VertexData = V;
    type EdgePayload = P;

    fn n_shards(&self) -> usize {
        self.inner.n_shards
    }

    fn n_vertices(&self) -> usize {
        self.inner.n_vertices
    }

    fn vertices_of_shard(&self, shard: usize) -> usize {
        self.inner.hash.shard_len(shard, self.inner.n_vertices)
    }

    fn global_id(&self, shard: usize, local: usize) -> u64 {
        self.inner.hash.unhash(shard, local)
    }

    fn pool(&self) -> &'static ThreadPool {
        self.inner.pool
    }

    fn data_seq(&self, shard: usize) -> Result<&[SyncCell<V>]> {
        let buffer = &self.inner.shards.data[shard];
        buffer.lock_seq()?;
        Ok(buffer.as_sync_slice::<V>()?)
    }

    fn active_seq(&self, shard: usize) -> Result<BitsetView<'_>> {
        let buffer = &self.inner.shards.active[shard];
        buffer.lock_seq()?;
        Ok(BitsetView::from_cells(buffer.as_sync_slice::<u64>()?))
    }

    fn frontier_seq(&self, shard: usize) -> Result<BitsetView<'_>> {
        let buffer = &self.inner.shards.frontiers[shard];
        buffer.lock_seq()?;
        Ok(BitsetView::from_cells(buffer.as_sync_slice::<u64>()?))
    }

    fn vertex_offsets(&self, shard: usize) -> Result<&[u64]> {
        let buffer = &self.inner.shards.vertices[shard];
        buffer.lock_seq()?;
        Ok(buffer.as_slice::<u64>()?)
    }

    fn edge_bytes(&self, shard: usize) -> Result<&[u8]> {
        Ok(self.inner.shards.edges[shard].lock_seq()?)
    }
}

impl<V: PlainData, P: PlainData, H: ShardHash> std::fmt::Debug for Graph<V, P, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("n_shards", &self.inner.n_shards)
            .field("n_vertices", &self.inner.n_vertices)
            .finish()
    }
}

/// Builds a graph and streams `edges` into it.
pub fn init_graph<V, P, H, E>(
    shards: usize,
    n_vertices: usize,
    hash: H,
    edges: impl IntoIterator<Item = E>,
) -> Result<Graph<V, P, H>>
where
    V: PlainData,
    P: PlainData,
    H: ShardHash,
    E: EdgeRecord<Payload = P>,
{
    let graph = Graph::new(shards, n_vertices, hash)?;
    graph.ingest(edges)?;
    Ok(graph)
}

/// The stored size of one edge record: a `u32` local offset plus the payload.
pub const fn edge_record_size<P>() -> usize {
    std::mem::size_of::<u32>() + std::mem::size_of::<P>()
}

/// A cursor over `(u32 local_offset, payload)` records in an adjacency
/// range.
pub struct Adjacency<'a, P: PlainData> {
    bytes: &'a [u8],
    _marker: PhantomData<P>,
}

impl<'a, P: PlainData> Adjacency<'a, P> {
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert_eq!(bytes.len() % edge_record_size::<P>(), 0);
        Self {
            bytes,
            _marker: PhantomData,
        }
    }

    /// The adjacency range of `source` within a shard's edge buffer.
    pub fn of_source(offsets: &[u64], edge_bytes: &'a [u8], source: u64) -> Self {
        let v = source as usize;
        if v >= offsets.len() {
            return Self::new(&[]);
        }
        let begin = offsets[v] as usize;
        let end = if v + 1 < offsets.len() {
            offsets[v + 1] as usize
        } else {
            edge_bytes.len()
        };
        Self::new(&edge_bytes[begin..end])
    }
}

impl<P: PlainData> Iterator for Adjacency<'_, P> {
    /// The destination's shard-local offset and the edge payload.
    type Item = (u32, P);

    fn next(&mut self) -> Option<(u32, P)> {
        if self.bytes.is_empty() {
            return None;
        }
        // SAFETY: records are packed, so both reads may be unaligned; `new`
        // checked that full records are available.
        let (local, payload) = unsafe {
            (
                std::ptr::read_unaligned(self.bytes.as_ptr() as *const u32),
                std::ptr::read_unaligned(self.bytes[4..].as_ptr() as *const P),
            )
        };
        self.bytes = &self.bytes[edge_record_size::<P>()..];
        Some((local, payload))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.bytes.len() / edge_record_size::<P>();
        (n, Some(n))
    }
}

fn plain_bytes<T: PlainData>(v: &T) -> &[u8] {
    // SAFETY: PlainData types are valid as raw bytes.
    let ptr: *const T = v;
    unsafe { std::slice::from_raw_parts(ptr as *const u8, std::mem::size_of::<T>()) }
}
