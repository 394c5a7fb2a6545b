/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use shardgraph::group::{Empty, TaskGroup};
use shardgraph::ops::DeltaView;
use shardgraph::pool::{Priority, ThreadPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_completion() -> Result<()> {
    let pool = ThreadPool::new(4);
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    group.start(64, move |_, _| {
        c.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    pool.submit(Priority::MAX, group.clone());
    group.wait()?;
    // Every shard was dispatched exactly once.
    assert_eq!(counter.load(Ordering::Relaxed), 64);
    assert!(group.done());
    Ok(())
}

#[test]
fn test_views_reduced_before_wait_returns() -> Result<()> {
    let pool = ThreadPool::new(4);
    let group = Arc::new(TaskGroup::<DeltaView>::default());
    group.start(32, move |_, view| {
        *view += 1.0;
        Ok(())
    });
    pool.submit(Priority::MAX, group.clone());
    group.wait()?;
    // Each shard contributed 1.0 through some worker's view.
    assert_eq!(group.data().get(), 32.0);
    Ok(())
}

#[test]
fn test_wait_without_start_returns() -> Result<()> {
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    group.wait()?;
    Ok(())
}

#[test]
fn test_zero_shards() -> Result<()> {
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    group.start(0, |_, _| Ok(()));
    group.run();
    group.wait()?;
    Ok(())
}

#[test]
fn test_reducer_serialization() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 100;
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    let in_reducer = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let group = group.clone();
            let in_reducer = in_reducer.clone();
            let runs = runs.clone();
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let in_reducer = in_reducer.clone();
                    let runs = runs.clone();
                    group.reduce(move |_| {
                        // Exactly one closure may be inside at a time.
                        assert!(!in_reducer.swap(true, Ordering::SeqCst));
                        std::thread::sleep(std::time::Duration::from_micros(10));
                        runs.fetch_add(1, Ordering::Relaxed);
                        in_reducer.store(false, Ordering::SeqCst);
                        Ok(())
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    // Every submitted closure ran exactly once.
    assert_eq!(runs.load(Ordering::Relaxed), THREADS * ROUNDS);
}

#[test]
fn test_error_does_not_deadlock_wait() {
    let pool = ThreadPool::new(2);
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    group.start(8, |shard, _| {
        if shard == 3 {
            anyhow::bail!("synthetic failure");
        }
        Ok(())
    });
    pool.submit(Priority::MAX, group.clone());
    let err = group.wait().unwrap_err();
    assert!(format!("{err:#}").contains("synthetic failure"));
}

#[test]
fn test_panic_still_signals_completion() {
    let pool = ThreadPool::new(2);
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    group.start(8, |shard, _| {
        if shard == 2 {
            panic!("synthetic panic");
        }
        Ok(())
    });
    pool.submit(Priority::MAX, group.clone());
    let err = group.wait().unwrap_err();
    assert!(format!("{err:#}").contains("panicked"));
}

#[test]
fn test_run_from_caller_thread() -> Result<()> {
    // A group can be driven without a pool: the caller participates.
    let group = Arc::new(TaskGroup::<DeltaView>::default());
    group.start(16, |_, view| {
        *view += 0.5;
        Ok(())
    });
    group.run();
    group.wait()?;
    assert_eq!(group.data().get(), 8.0);
    Ok(())
}

#[test]
fn test_pool_shutdown_joins() {
    let pool = ThreadPool::new(3);
    let group = Arc::new(TaskGroup::<Empty>::new(()));
    group.start(4, |_, _| Ok(()));
    pool.submit(0, group.clone());
    group.wait().unwrap();
    // Dropping the pool delivers the shutdown sentinel to all workers.
    drop(pool);
}
