/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Shard-parallel task groups with per-worker views and a serialized reducer
//! chain.
//!
//! A [`TaskGroup`] iterates a task over `shards` work units. Any number of
//! threads can [`run`](TaskGroup::run) the group; an atomic cursor hands out
//! shards without duplication. Each participating thread builds a fresh
//! [`View`] and receives it by argument on every task call; when the thread
//! runs out of shards the view publishes its contribution through
//! [`reduce`](TaskGroup::reduce).
//!
//! `reduce` is a combiner: the first entrant runs closures, latecomers
//! enqueue theirs and return immediately. At most one reducer closure runs at
//! a time across the whole group, yet no thread ever blocks on another
//! reducer.
//!
//! Completion is signaled when every shard has been handed out and the last
//! participant has left — including participants that failed, so
//! [`wait`](TaskGroup::wait) cannot deadlock on an error path; it reports the
//! first error instead.

use crate::pool::panic_message;
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

/// A per-worker accumulator for a [`TaskGroup`].
///
/// One view is constructed per participating thread and dropped after
/// [`apply`](View::apply); the group never aliases views across threads.
pub trait View: Sized + Send + 'static {
    /// Group-wide data, shared by all participants.
    ///
    /// Fields read by [`new`](View::new) must not be mutated by reducer
    /// closures; mutation goes through interior-mutability cells that only
    /// reducers touch.
    type TaskData: Send + Sync + 'static;

    fn new(data: &Self::TaskData) -> Self;

    /// Publishes this view's contribution, normally via
    /// [`TaskGroup::reduce`].
    fn apply(self, group: &TaskGroup<Self>);
}

/// The unit view, for groups that need no accumulation.
pub struct Empty;

impl View for Empty {
    type TaskData = ();

    fn new(_: &()) -> Self {
        Empty
    }

    fn apply(self, _: &TaskGroup<Self>) {}
}

type TaskFn<V> = Box<dyn Fn(usize, &mut V) -> Result<()> + Send + Sync>;
type ReduceFn<V> = Box<dyn FnOnce(&<V as View>::TaskData) -> Result<()> + Send>;

struct ReducerQueue<V: View> {
    queue: VecDeque<ReduceFn<V>>,
    /// Set by a drainer that found the queue empty; the next entrant clears
    /// it and drains in its place.
    exiting: bool,
}

/// A parallel iteration over `shards` work units.
pub struct TaskGroup<V: View> {
    data: V::TaskData,
    task: OnceLock<TaskFn<V>>,
    shards: AtomicUsize,
    next_shard: AtomicUsize,
    nworkers: AtomicUsize,
    nreducers: AtomicUsize,
    reducers: Mutex<ReducerQueue<V>>,
    error: Mutex<Option<anyhow::Error>>,
    done_flag: Mutex<bool>,
    done_cond: Condvar,
}

impl<V: View> Default for TaskGroup<V>
where
    V::TaskData: Default,
{
    fn default() -> Self {
        Self::new(V::TaskData::default())
    }
}

impl<V: View> TaskGroup<V> {
    pub fn new(data: V::TaskData) -> Self {
        Self {
            data,
            task: OnceLock::new(),
            shards: AtomicUsize::new(0),
            next_shard: AtomicUsize::new(0),
            nworkers: AtomicUsize::new(0),
            nreducers: AtomicUsize::new(0),
            reducers: Mutex::new(ReducerQueue {
                queue: VecDeque::new(),
                exiting: false,
            }),
            error: Mutex::new(None),
            done_flag: Mutex::new(false),
            done_cond: Condvar::new(),
        }
    }

    /// One-shot configuration of the work-unit count and the task.
    ///
    /// # Panics
    ///
    /// Panics if the group has already been started.
    pub fn start<F>(&self, shards: usize, task: F)
    where
        F: Fn(usize, &mut V) -> Result<()> + Send + Sync + 'static,
    {
        if self.task.set(Box::new(task)).is_err() {
            panic!("task group started twice");
        }
        self.shards.store(shards, Ordering::Release);
    }

    /// The group-wide task data.
    ///
    /// Reducer-mutated cells are stable only after [`wait`](Self::wait)
    /// returns.
    pub fn data(&self) -> &V::TaskData {
        &self.data
    }

    /// Whether every shard has been handed out to some participant.
    pub fn done(&self) -> bool {
        self.next_shard.load(Ordering::Relaxed) >= self.shards.load(Ordering::Acquire)
    }

    /// Participates in the group: processes shards until the cursor runs out,
    /// then applies this thread's view.
    pub fn run(&self) {
        let shards = self.shards.load(Ordering::Acquire);
        if self.next_shard.load(Ordering::Relaxed) >= shards {
            return;
        }
        // Register before taking a shard, so completion cannot be signaled
        // while this thread still holds undispatched work.
        let _participation = Participation::enter(self);
        let mut shard = self.next_shard.fetch_add(1, Ordering::Relaxed);
        if shard >= shards {
            return;
        }
        let task = self.task.get().expect("task group run before start");
        let mut view = V::new(&self.data);
        while shard < shards {
            // Take the next shard before working on the current one, leaving
            // room to overlap a memory prefetch with the current task.
            let next = self.next_shard.fetch_add(1, Ordering::Relaxed);
            match catch_unwind(AssertUnwindSafe(|| task(shard, &mut view))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.record_error(e.context(format!("shard task {shard} failed")));
                    break;
                }
                Err(payload) => {
                    self.record_error(anyhow!(
                        "shard task {shard} panicked: {}",
                        panic_message(payload.as_ref())
                    ));
                    break;
                }
            }
            shard = next;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| view.apply(self))) {
            self.record_error(anyhow!(
                "view apply panicked: {}",
                panic_message(payload.as_ref())
            ));
        }
    }

    /// Runs `f` under the group's reducer serialization.
    ///
    /// The first entrant becomes the drainer and executes closures; threads
    /// arriving while a drainer is active enqueue and return. Exactly one
    /// closure runs at a time; errors are recorded and reported by
    /// [`wait`](Self::wait).
    pub fn reduce<F>(&self, f: F)
    where
        F: FnOnce(&V::TaskData) -> Result<()> + Send + 'static,
    {
        if self.nreducers.fetch_add(1, Ordering::AcqRel) > 0 {
            let mut state = self.reducers.lock().unwrap();
            if !state.exiting {
                state.queue.push_back(Box::new(f));
                return;
            }
            // The drainer is on its way out; take over its role.
            state.exiting = false;
        }

        if let Err(e) = f(&self.data) {
            self.record_error(e.context("reducer failed"));
        }
        loop {
            if self.nreducers.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
            let next = {
                let mut state = self.reducers.lock().unwrap();
                match state.queue.pop_front() {
                    Some(g) => g,
                    None => {
                        // A concurrent entrant has incremented but not yet
                        // enqueued; leave it the drainer role.
                        state.exiting = true;
                        return;
                    }
                }
            };
            if let Err(e) = next(&self.data) {
                self.record_error(e.context("reducer failed"));
            }
        }
    }

    /// Blocks until the group completes, if it has been started with a
    /// nonzero shard count. Returns the first error recorded by a task or
    /// reducer.
    pub fn wait(&self) -> Result<()> {
        if self.shards.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let mut done = self.done_flag.lock().unwrap();
        while !*done {
            done = self.done_cond.wait(done).unwrap();
        }
        drop(done);
        match self.error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record_error(&self, e: anyhow::Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        } else {
            log::error!("further task group error: {e:#}");
        }
    }

    fn complete(&self) {
        *self.done_flag.lock().unwrap() = true;
        self.done_cond.notify_all();
    }
}

impl<V: View> crate::pool::PoolTask for TaskGroup<V> {
    fn run(&self) {
        TaskGroup::run(self)
    }

    fn done(&self) -> bool {
        TaskGroup::done(self)
    }
}

impl<V: View> std::fmt::Debug for TaskGroup<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("shards", &self.shards.load(Ordering::Relaxed))
            .field("next_shard", &self.next_shard.load(Ordering::Relaxed))
            .field("nworkers", &self.nworkers.load(Ordering::Relaxed))
            .finish()
    }
}

/// Participation guard: keeps the worker count exact and signals completion
/// on every exit path, panics included.
struct Participation<'a, V: View> {
    group: &'a TaskGroup<V>,
}

impl<'a, V: View> Participation<'a, V> {
    fn enter(group: &'a TaskGroup<V>) -> Self {
        group.nworkers.fetch_add(1, Ordering::AcqRel);
        Self { group }
    }
}

impl<V: View> Drop for Participation<'_, V> {
    fn drop(&mut self) {
        if self.group.nworkers.fetch_sub(1, Ordering::AcqRel) == 1 && self.group.done() {
            self.group.complete();
        }
    }
}
