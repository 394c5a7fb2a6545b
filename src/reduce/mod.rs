/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Monoid accumulators for cross-thread reductions.
//!
//! A [`Reducer`] wraps an atomic location updated with relaxed
//! compare-exchange; progress metrics and convergence deltas do not need a
//! stronger ordering, and algorithms that do should accumulate locally in a
//! [`SubReducer`] and let the serialized reducer chain publish the merge.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A monoid over `T`: an identity and an associative update.
pub trait Monoid<T: Copy>: 'static {
    fn identity() -> T;
    fn update(acc: &mut T, v: T);
}

/// The additive monoid.
pub struct ReducePlus;

macro_rules! impl_reduce_plus {
    ($($t:ty => $zero:expr),*) => {$(
        impl Monoid<$t> for ReducePlus {
            fn identity() -> $t {
                $zero
            }
            fn update(acc: &mut $t, v: $t) {
                *acc += v;
            }
        }
    )*};
}

impl_reduce_plus!(usize => 0, u64 => 0, i64 => 0, f64 => 0.0);

/// Values with an atomic representation usable by [`Reducer`].
pub trait AtomicValue: Copy + Send + Sync + 'static {
    type Atomic: Send + Sync;

    fn into_atomic(self) -> Self::Atomic;
    /// Relaxed load.
    fn load(a: &Self::Atomic) -> Self;
    /// Relaxed compare-exchange; returns the observed value on failure.
    fn compare_exchange_weak(a: &Self::Atomic, current: Self, new: Self) -> Result<(), Self>;
}

macro_rules! impl_atomic_value {
    ($($t:ty => $atomic:ty),*) => {$(
        impl AtomicValue for $t {
            type Atomic = $atomic;

            fn into_atomic(self) -> $atomic {
                <$atomic>::new(self)
            }

            fn load(a: &$atomic) -> Self {
                a.load(Ordering::Relaxed)
            }

            fn compare_exchange_weak(a: &$atomic, current: Self, new: Self) -> Result<(), Self> {
                a.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
                    .map(|_| ())
            }
        }
    )*};
}

impl_atomic_value!(usize => AtomicUsize, u64 => AtomicU64);

impl AtomicValue for f64 {
    type Atomic = AtomicU64;

    fn into_atomic(self) -> AtomicU64 {
        AtomicU64::new(self.to_bits())
    }

    fn load(a: &AtomicU64) -> Self {
        f64::from_bits(a.load(Ordering::Relaxed))
    }

    fn compare_exchange_weak(a: &AtomicU64, current: Self, new: Self) -> Result<(), f64> {
        // Compare on the bit pattern so NaN cannot livelock the loop.
        a.compare_exchange_weak(
            current.to_bits(),
            new.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .map(|_| ())
        .map_err(f64::from_bits)
    }
}

/// An atomic accumulator for the monoid `M`.
pub struct Reducer<T: AtomicValue, M: Monoid<T> = ReducePlus> {
    cell: T::Atomic,
    _marker: PhantomData<M>,
}

/// An additive [`Reducer`].
pub type Sum<T> = Reducer<T, ReducePlus>;

impl<T: AtomicValue, M: Monoid<T>> Default for Reducer<T, M> {
    fn default() -> Self {
        Self::new(M::identity())
    }
}

impl<T: AtomicValue, M: Monoid<T>> Reducer<T, M> {
    pub fn new(v: T) -> Self {
        Self {
            cell: v.into_atomic(),
            _marker: PhantomData,
        }
    }

    /// Folds `v` into the accumulator with a relaxed compare-exchange loop.
    pub fn add(&self, v: T) {
        let mut current = T::load(&self.cell);
        loop {
            let mut new = current;
            M::update(&mut new, v);
            match T::compare_exchange_weak(&self.cell, current, new) {
                Ok(()) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self) -> T {
        T::load(&self.cell)
    }

    /// Returns a thread-local sub-accumulator that flushes into this reducer
    /// when dropped.
    pub fn subreducer(&self) -> SubReducer<'_, T, M> {
        SubReducer {
            parent: self,
            acc: M::identity(),
        }
    }
}

impl<T: AtomicValue + std::fmt::Debug, M: Monoid<T>> std::fmt::Debug for Reducer<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Reducer").field(&self.get()).finish()
    }
}

/// A local accumulator that publishes into its parent [`Reducer`] on drop.
pub struct SubReducer<'a, T: AtomicValue, M: Monoid<T>> {
    parent: &'a Reducer<T, M>,
    acc: T,
}

impl<T: AtomicValue, M: Monoid<T>> SubReducer<'_, T, M> {
    pub fn update(&mut self, v: T) {
        M::update(&mut self.acc, v);
    }

    pub fn local(&self) -> T {
        self.acc
    }
}

impl<T: AtomicValue, M: Monoid<T>> Drop for SubReducer<'_, T, M> {
    fn drop(&mut self) {
        self.parent.add(self.acc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum() {
        let r = Sum::<u64>::default();
        r.add(3);
        r.add(4);
        assert_eq!(r.get(), 7);
    }

    #[test]
    fn test_concurrent_adds() {
        let r = Sum::<f64>::default();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        r.add(0.5);
                    }
                });
            }
        });
        assert_eq!(r.get(), 4000.0);
    }

    #[test]
    fn test_subreducer_flush() {
        let r = Sum::<usize>::default();
        {
            let mut sub = r.subreducer();
            sub.update(10);
            sub.update(5);
            assert_eq!(sub.local(), 15);
            assert_eq!(r.get(), 0);
        }
        assert_eq!(r.get(), 15);
    }
}
