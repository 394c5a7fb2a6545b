/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Memory-mapped edge files.
//!
//! An edge file is a packed sequence of host-endian `{u64 from, u64 to
//! [, payload]}` records — the in-memory layout of the [`EdgeRecord`] type it
//! is read as. No portable format is defined.

use super::EdgeRecord;
use anyhow::{ensure, Context, Result};
use mmap_rs::{Mmap, MmapFlags, MmapOptions};
use std::path::Path;

/// A read-only mapping of an edge file, iterable as records of type `E`.
pub struct EdgeFile<E: EdgeRecord> {
    map: Option<Mmap>,
    num_edges: usize,
    _marker: std::marker::PhantomData<E>,
}

impl<E: EdgeRecord> EdgeFile<E> {
    /// Maps `path` for sequential reading.
    ///
    /// Fails if the file length is not a multiple of the record size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let record_size = std::mem::size_of::<E>();
        let file_len = path
            .metadata()
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len() as usize;
        ensure!(
            file_len % record_size == 0,
            "{} is {} bytes, not a multiple of the {}-byte record size",
            path.display(),
            file_len,
            record_size
        );
        let map = if file_len > 0 {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            let map = unsafe {
                MmapOptions::new(file_len)
                    .with_context(|| format!("Cannot initialize mmap of size {file_len}"))?
                    .with_flags(MmapFlags::SHARED)
                    .with_file(&file, 0)
                    .map()
                    .with_context(|| format!("Cannot mmap {}", path.display()))?
            };
            // SAFETY: the mapping covers `file_len` bytes.
            if unsafe {
                libc::madvise(map.as_ptr() as *mut libc::c_void, file_len, libc::MADV_SEQUENTIAL)
            } != 0
            {
                log::warn!("madvise failed on {}", path.display());
            }
            Some(map)
        } else {
            None
        };
        Ok(Self {
            map,
            num_edges: file_len / record_size,
            _marker: std::marker::PhantomData,
        })
    }

    /// The number of records.
    pub fn len(&self) -> usize {
        self.num_edges
    }

    pub fn is_empty(&self) -> bool {
        self.num_edges == 0
    }

    /// Iterates the records in file order.
    pub fn iter(&self) -> impl Iterator<Item = E> + '_ {
        let base = self.map.as_ref().map(|m| m.as_ptr()).unwrap_or(std::ptr::null());
        let record_size = std::mem::size_of::<E>();
        (0..self.num_edges).map(move |i| {
            // SAFETY: `i < num_edges`, and records may straddle alignment.
            unsafe { std::ptr::read_unaligned(base.add(i * record_size) as *const E) }
        })
    }
}

impl<E: EdgeRecord> std::fmt::Debug for EdgeFile<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeFile")
            .field("num_edges", &self.num_edges)
            .finish()
    }
}
