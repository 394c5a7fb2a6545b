/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Packed bitsets backing frontiers and active sets.
//!
//! The on-buffer layout is a `u64` length header (in bits) followed by packed
//! 64-bit words; [`Bitset::allocate_size`] returns the number of bytes a
//! [`FileBuffer`](crate::buffer::FileBuffer) must reserve for a given length.
//! The same layout has two faces: [`Bitset`], which owns its words on the
//! heap and is used for per-task private frontier views, and [`BitsetView`],
//! which operates in place over a frozen shard buffer.
//!
//! Neither face is thread-safe by itself: a view is written either by the
//! single task that owns its shard or inside the shard's reducer critical
//! section.

use sync_cell_slice::SyncCell;

const BITS_PER_WORD: usize = u64::BITS as usize;

const fn words_for(bits: usize) -> usize {
    bits.div_ceil(BITS_PER_WORD)
}

/// Mask selecting the bits of the last word that are within `len`.
const fn tail_mask(len: usize) -> u64 {
    match len % BITS_PER_WORD {
        0 => !0,
        r => (1u64 << r) - 1,
    }
}

/// A heap-owned packed bitset.
#[derive(Debug, Clone)]
pub struct Bitset {
    len: usize,
    words: Vec<u64>,
}

impl Bitset {
    /// Creates a zeroed bitset of `len` bits.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; words_for(len)],
        }
    }

    /// The number of bytes of buffer space needed to hold a [`BitsetView`] of
    /// `bits` bits (header included).
    pub const fn allocate_size(bits: usize) -> usize {
        8 + 8 * words_for(bits)
    }

    /// The length in bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / BITS_PER_WORD] |= 1 << (i % BITS_PER_WORD);
    }

    pub fn unset(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / BITS_PER_WORD] &= !(1 << (i % BITS_PER_WORD));
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.words[i / BITS_PER_WORD] & (1 << (i % BITS_PER_WORD)) != 0
    }

    /// Sets every bit. Bits beyond `len` in the last word stay clear so that
    /// [`for_each`](Self::for_each) never visits them.
    pub fn set_all(&mut self) {
        if self.len == 0 {
            return;
        }
        self.words.fill(!0);
        let last = self.words.len() - 1;
        self.words[last] &= tail_mask(self.len);
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Resizes to `new_len` bits; newly exposed bits are clear.
    pub fn resize(&mut self, new_len: usize) {
        self.words.resize(words_for(new_len), 0);
        if new_len < self.len && !self.words.is_empty() {
            let last = self.words.len() - 1;
            self.words[last] &= tail_mask(new_len);
        }
        self.len = new_len;
    }

    /// Invokes `f` with the index of every set bit, in ascending order.
    pub fn for_each(&self, mut f: impl FnMut(usize)) {
        for (wi, &word) in self.words.iter().enumerate() {
            let mut m = word;
            while m != 0 {
                let b = m.trailing_zeros() as usize;
                m &= m - 1;
                f(wi * BITS_PER_WORD + b);
            }
        }
    }

    /// Counts the set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub(crate) fn words(&self) -> &[u64] {
        &self.words
    }
}

impl std::ops::BitOrAssign<&Bitset> for Bitset {
    /// ORs a same-or-shorter bitset into `self`.
    fn bitor_assign(&mut self, rhs: &Bitset) {
        debug_assert!(rhs.len <= self.len);
        for (w, r) in self.words.iter_mut().zip(rhs.words.iter()) {
            *w |= r;
        }
    }
}

/// A bitset operating in place over a frozen shard buffer.
///
/// The first word of the underlying slice is the length header; the packed
/// words follow. All operations go through [`SyncCell`] because several
/// threads hold views of the same shard at once; the engine guarantees a
/// single writer (the owning shard task, or the serialized reducer).
#[derive(Clone, Copy)]
pub struct BitsetView<'a> {
    len: usize,
    cells: &'a [SyncCell<u64>],
}

impl<'a> BitsetView<'a> {
    /// Wraps a buffer slice, reading the length from the header word.
    pub fn from_cells(cells: &'a [SyncCell<u64>]) -> Self {
        assert!(!cells.is_empty(), "bitset buffer lacks a header word");
        // SAFETY: the header is written once at initialization.
        let len = unsafe { cells[0].get() } as usize;
        debug_assert!(words_for(len) <= cells.len() - 1);
        Self {
            len,
            cells: &cells[..=words_for(len)],
        }
    }

    /// Writes the length header into a freshly allocated buffer slice and
    /// returns the view. The words are expected to be zeroed (buffers are
    /// zero-filled on allocation).
    pub fn init(cells: &'a [SyncCell<u64>], len: usize) -> Self {
        assert!(
            cells.len() > words_for(len),
            "bitset buffer too small for {len} bits"
        );
        // SAFETY: single writer; the view is not shared yet.
        unsafe { cells[0].set(len as u64) };
        Self {
            len,
            cells: &cells[..=words_for(len)],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word(&self, wi: usize) -> u64 {
        // SAFETY: engine locking discipline (see type docs).
        unsafe { self.cells[1 + wi].get() }
    }

    fn set_word(&self, wi: usize, w: u64) {
        // SAFETY: engine locking discipline (see type docs).
        unsafe { self.cells[1 + wi].set(w) }
    }

    pub fn set(&self, i: usize) {
        debug_assert!(i < self.len);
        let wi = i / BITS_PER_WORD;
        self.set_word(wi, self.word(wi) | 1 << (i % BITS_PER_WORD));
    }

    pub fn unset(&self, i: usize) {
        debug_assert!(i < self.len);
        let wi = i / BITS_PER_WORD;
        self.set_word(wi, self.word(wi) & !(1 << (i % BITS_PER_WORD)));
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.word(i / BITS_PER_WORD) & (1 << (i % BITS_PER_WORD)) != 0
    }

    pub fn set_all(&self) {
        let nwords = words_for(self.len);
        if nwords == 0 {
            return;
        }
        for wi in 0..nwords - 1 {
            self.set_word(wi, !0);
        }
        self.set_word(nwords - 1, tail_mask(self.len));
    }

    pub fn clear(&self) {
        for wi in 0..words_for(self.len) {
            self.set_word(wi, 0);
        }
    }

    /// Invokes `f` with the index of every set bit, in ascending order.
    ///
    /// Each word is snapshotted before its bits are visited, so `f` may
    /// [`unset`](Self::unset) the bit it was called with.
    pub fn for_each(&self, mut f: impl FnMut(usize)) {
        for wi in 0..words_for(self.len) {
            let mut m = self.word(wi);
            while m != 0 {
                let b = m.trailing_zeros() as usize;
                m &= m - 1;
                f(wi * BITS_PER_WORD + b);
            }
        }
    }

    pub fn count(&self) -> usize {
        (0..words_for(self.len))
            .map(|wi| self.word(wi).count_ones() as usize)
            .sum()
    }

    /// ORs a same-or-shorter owned bitset into this view.
    ///
    /// Called only inside the shard's reducer critical section.
    pub fn or_assign(&self, other: &Bitset) {
        debug_assert!(other.len() <= self.len);
        for (wi, &r) in other.words().iter().enumerate() {
            if r != 0 {
                self.set_word(wi, self.word(wi) | r);
            }
        }
    }

    /// Overwrites this view with the contents of `other`, clearing any
    /// trailing words. Used to adopt a frontier as the next active set.
    pub fn copy_from(&self, other: &BitsetView<'_>) {
        debug_assert!(other.len() <= self.len);
        let src_words = words_for(other.len());
        for wi in 0..src_words {
            self.set_word(wi, other.word(wi));
        }
        for wi in src_words..words_for(self.len) {
            self.set_word(wi, 0);
        }
    }
}

impl std::fmt::Debug for BitsetView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitsetView")
            .field("len", &self.len)
            .field("count", &self.count())
            .finish()
    }
}
