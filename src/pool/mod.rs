/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The NUMA-pinned worker pool.
//!
//! A [`ThreadPool`] starts one worker per configured CPU; each worker pins
//! itself to its CPU and binds its memory allocation to the CPU's NUMA node
//! before pulling work. Work units are [task groups](crate::group::TaskGroup)
//! in a max-heap priority queue: a worker that pops a group re-inserts it at
//! slightly lower priority so its peers can join the same group, then
//! participates until the group's shards are exhausted.
//!
//! Submission comes in two flavors: [`submit`](ThreadPool::submit) enqueues,
//! while [`submit_and_join`](ThreadPool::submit_and_join), called from a
//! worker, enqueues at decremented priority and participates inline — nested
//! groups keep their submitter's locality and start below the surrounding
//! work so unbounded nesting cannot starve it.

pub mod numa;

use std::cell::Cell;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

/// Queue priority; larger runs earlier. A soft hint, not a lock ordering.
pub type Priority = i32;

/// A unit of poolable work, re-invocable until [`done`](PoolTask::done).
pub trait PoolTask: Send + Sync {
    /// Participates in the task; returns when no work is left for this
    /// thread.
    fn run(&self);
    /// Whether every work unit has been handed out.
    fn done(&self) -> bool;
}

enum Item {
    Group(Arc<dyn PoolTask>),
    Shutdown,
}

struct Entry {
    priority: Priority,
    item: Item,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

struct PoolInner {
    id: usize,
    queue: Mutex<BinaryHeap<Entry>>,
    cond: Condvar,
    nthreads: usize,
}

thread_local! {
    /// The pool id the current thread works for, if any.
    static WORKER_OF: Cell<usize> = const { Cell::new(usize::MAX) };
}

static POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// A fixed pool of CPU-pinned, NUMA-bound workers.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Starts `num_threads` workers, pinned to CPUs `0..num_threads`.
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);
        let topology = numa::NumaTopology::detect();
        log::info!(
            "starting {} workers over {} NUMA node(s)",
            num_threads,
            topology.num_nodes()
        );
        let inner = Arc::new(PoolInner {
            id: POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            nthreads: num_threads,
        });
        let workers = (0..num_threads)
            .map(|cpu| {
                let inner = inner.clone();
                let node = topology.node_of_cpu(cpu);
                std::thread::Builder::new()
                    .name(format!("shard-worker-{cpu}"))
                    .spawn(move || worker_main(inner, cpu, node))
                    .expect("could not spawn pool worker")
            })
            .collect();
        Self { inner, workers }
    }

    pub fn num_workers(&self) -> usize {
        self.inner.nthreads
    }

    /// Whether the calling thread is a worker of this pool.
    pub fn is_worker(&self) -> bool {
        WORKER_OF.with(|w| w.get()) == self.inner.id
    }

    /// Enqueues a task group at the given priority.
    pub fn submit(&self, priority: Priority, task: Arc<dyn PoolTask>) {
        self.inner.queue.lock().unwrap().push(Entry {
            priority,
            item: Item::Group(task),
        });
        self.inner.cond.notify_one();
    }

    /// Enqueues a task group and, when called from a worker of this pool,
    /// participates inline.
    ///
    /// The inline submission is stored at `priority - 1` so freshly nested
    /// work starts below the work that spawned it. From a non-worker thread
    /// this is a plain [`submit`](Self::submit).
    pub fn submit_and_join(&self, priority: Priority, task: Arc<dyn PoolTask>) {
        if !self.is_worker() {
            self.submit(priority, task);
            return;
        }
        self.submit(priority.saturating_sub(1), task.clone());
        task.run();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.inner.queue.lock().unwrap().push(Entry {
            priority: -(self.inner.nthreads as Priority),
            item: Item::Shutdown,
        });
        self.inner.cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.inner.nthreads)
            .finish()
    }
}

/// The process-wide pool, sized to the configured CPUs.
pub fn default_pool() -> &'static ThreadPool {
    static DEFAULT: OnceLock<ThreadPool> = OnceLock::new();
    DEFAULT.get_or_init(|| ThreadPool::new(num_cpus::get()))
}

fn worker_main(inner: Arc<PoolInner>, cpu: usize, node: usize) {
    #[cfg(feature = "thread-pinning")]
    if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
        log::warn!("could not pin worker to CPU {cpu}");
    }
    #[cfg(feature = "numa")]
    if let Err(e) = numa::bind_current_thread(node) {
        log::warn!("could not bind worker memory to NUMA node {node}: {e:#}");
    }
    #[cfg(not(feature = "numa"))]
    let _ = node;

    WORKER_OF.with(|w| w.set(inner.id));

    let mut queue = inner.queue.lock().unwrap();
    loop {
        let Entry { priority, item } = loop {
            match queue.pop() {
                Some(entry) => break entry,
                None => queue = inner.cond.wait(queue).unwrap(),
            }
        };
        match item {
            Item::Shutdown => {
                // Leave the sentinel for the other workers.
                queue.push(Entry {
                    priority,
                    item: Item::Shutdown,
                });
                drop(queue);
                inner.cond.notify_one();
                return;
            }
            Item::Group(group) => {
                if group.done() {
                    continue;
                }
                queue.push(Entry {
                    priority: priority.saturating_sub(1),
                    item: Item::Group(group.clone()),
                });
                drop(queue);
                inner.cond.notify_one();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| group.run())) {
                    log::error!("task group panicked: {}", panic_message(&payload));
                }
                queue = inner.queue.lock().unwrap();
            }
        }
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
