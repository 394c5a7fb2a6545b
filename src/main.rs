/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! PageRank driver over a packed edge file.

use anyhow::Result;
use clap::Parser;
use dsi_progress_logger::*;
use shardgraph::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "Computes PageRank over a packed host-endian edge file.", long_about = None)]
struct Args {
    /// A file of packed {u64 from, u64 to} records, host byte order,
    /// sorted by source.
    edge_file: PathBuf,
    /// The number of vertices; ids in the file must be smaller.
    #[arg(short, long)]
    vertices: usize,
    /// The number of shards (defaults to one per ~1Mi vertices).
    #[arg(short, long)]
    shards: Option<usize>,
    /// The damping factor.
    #[arg(short, long, default_value_t = 0.85)]
    damping: f64,
    /// Stop when the L1 norm of the rank delta falls below this threshold.
    #[arg(short, long, default_value_t = 1E-7)]
    epsilon: f64,
    /// Stop after this many iterations regardless of convergence.
    #[arg(short, long, default_value_t = 100)]
    max_iters: usize,
    /// How many of the top-ranked vertices to print.
    #[arg(short, long, default_value_t = 10)]
    top: usize,
}

#[derive(Clone, Copy)]
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

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let n = args.vertices;
    let shards = args.shards.unwrap_or(n / 0x100000 + 1);
    log::info!("{n} vertices over {shards} shard(s)");

    let edge_file = EdgeFile::<Edge>::open(&args.edge_file)?;
    log::info!("{} edges", edge_file.len());

    let mut out_degrees = vec![0u64; n];
    for edge in edge_file.iter() {
        anyhow::ensure!(
            (edge.from as usize) < n && (edge.to as usize) < n,
            "edge ({}, {}) out of the vertex range",
            edge.from,
            edge.to
        );
        out_degrees[edge.from as usize] += 1;
    }

    let graph: Graph<Rank> = init_graph(shards, n, DefaultHash::new(shards), edge_file.iter())?;
    graph.fill_vertex_data(move |v| Rank {
        curr: 1.0 / n as f64,
        next: 0.0,
        out_degree: out_degrees[v as usize],
    })?;
    graph.active_all()?;

    let damping = args.damping;
    let teleport = (1.0 - damping) / n as f64;
    let mut pl = ProgressLogger::default();
    pl.item_name("iteration");
    pl.start("Iterating to the fixed point...");
    let mut iterations = 0;
    for _ in 0..args.max_iters {
        edge_map::<RankAccum, _, _>(&graph, |src, _, accum| {
            accum.0 += src.curr / src.out_degree as f64;
            true
        })?;
        let delta = Arc::new(TaskGroup::<DeltaView>::default());
        vertex_map_with(&delta, &graph, move |v, view| {
            let next = v.next * damping + teleport;
            *view += (next - v.curr).abs();
            v.curr = next;
            v.next = 0.0;
            true
        })?;
        iterations += 1;
        pl.update();
        if delta.data().get() < args.epsilon {
            break;
        }
    }
    pl.done();
    log::info!("converged in {iterations} iteration(s)");

    // Gather the ranks back out of the shards.
    let mut ranks = Vec::with_capacity(n);
    for shard in 0..graph.n_shards() {
        let data = graph.data_seq(shard)?;
        for (local, cell) in data.iter().enumerate() {
            // SAFETY: no group is running.
            ranks.push((graph.global_id(shard, local), unsafe { cell.get() }.curr));
        }
    }
    ranks.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (v, rank) in ranks.iter().take(args.top) {
        println!("{v}\t{rank}");
    }
    Ok(())
}
