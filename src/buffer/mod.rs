/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Growable spill-file buffers with an append/freeze/lock lifecycle.
//!
//! A [`FileBuffer`] starts unopened; the first [`write`](FileBuffer::write)
//! creates a monotonically numbered spill file in the buffer's spill
//! directory and maps it writable, growing by doubling. The first read access
//! ([`freeze`](FileBuffer::freeze), [`lock`](FileBuffer::lock),
//! [`lock_seq`](FileBuffer::lock_seq) or one of the typed accessors) freezes
//! the buffer: the mapping is cut to the logical length, our file handle is
//! dropped, and any further [`write`](FileBuffer::write) fails with
//! [`BufferError::Frozen`]. The spill file is unlinked when the buffer is
//! dropped, after the mapping is gone.
//!
//! `lock`/`lock_seq` issue `madvise` access-pattern hints;
//! [`unlock`](FileBuffer::unlock)/[`unlock_seq`](FileBuffer::unlock_seq) are
//! advisory no-ops. The frozen mapping stays shared and writable: the engine
//! serializes writers (one task per shard, reducer-serialized merges), and the
//! [`SyncCell`] access surface keeps that discipline visible at every write.

use mmap_rs::{MmapFlags, MmapMut, MmapOptions};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use sync_cell_slice::SyncCell;
use thiserror::Error;

/// Spill files are numbered from a process-wide counter.
static SPILL_ID: AtomicUsize = AtomicUsize::new(0);

const MIN_CAPACITY: usize = 4096;

/// Errors of the buffer lifecycle.
///
/// OS failures are fatal to the task that hit them; the engine makes no
/// attempt at local recovery.
#[derive(Debug, Error)]
pub enum BufferError {
    /// A file-system call failed.
    #[error("{reason}: {source}")]
    Os {
        reason: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// Mapping or remapping failed.
    #[error("{reason}: {source}")]
    Map {
        reason: &'static str,
        #[source]
        source: mmap_rs::Error,
    },
    /// A write was attempted after [`FileBuffer::freeze`].
    #[error("write to frozen buffer")]
    Frozen,
}

impl BufferError {
    fn os(reason: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Os { reason, source }
    }

    fn map(reason: &'static str) -> impl FnOnce(mmap_rs::Error) -> Self {
        move |source| Self::Map { reason, source }
    }

    /// The OS error code, when one is attached.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Types that can live in a shard buffer as raw bytes.
///
/// # Safety
///
/// Implementors must be plain old data: no padding-dependent invariants, no
/// pointers, valid for any bit pattern, `#[repr(C)]` or a primitive. The
/// zero-filled pages of a fresh buffer must be a valid value.
pub unsafe trait PlainData: Copy + Send + Sync + 'static {}

macro_rules! impl_plain_data {
    ($($t:ty),*) => {$(
        unsafe impl PlainData for $t {}
    )*};
}

impl_plain_data!((), u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

enum State {
    Unopened,
    Appending {
        file: File,
        map: Option<MmapMut>,
        capacity: usize,
    },
    Frozen {
        map: Option<MmapMut>,
    },
}

struct Inner {
    state: State,
    len: usize,
    path: Option<PathBuf>,
    dir: PathBuf,
}

/// A growable, spill-file-backed byte buffer.
///
/// All operations take `&self`: shard tasks on different threads freeze and
/// read the same buffer concurrently. Once frozen, the mapping address is
/// stable until the buffer is dropped, so the slices handed out by the typed
/// accessors stay valid for the borrow of `self`.
pub struct FileBuffer {
    inner: Mutex<Inner>,
}

impl Default for FileBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FileBuffer {
    /// Creates an unopened buffer spilling into the current directory.
    pub fn new() -> Self {
        Self::in_dir(".")
    }

    /// Creates an unopened buffer spilling into `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Unopened,
                len: 0,
                path: None,
                dir: dir.into(),
            }),
        }
    }

    /// The logical length in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, State::Frozen { .. })
    }

    /// Appends `bytes`, opening the spill file and growing the mapping as
    /// needed.
    pub fn write(&self, bytes: &[u8]) -> Result<(), BufferError> {
        let mut g = self.inner.lock().unwrap();
        if matches!(g.state, State::Frozen { .. }) {
            return Err(BufferError::Frozen);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let need = g.len + bytes.len();
        let inner = &mut *g;
        Self::ensure_mapped(inner, need)?;
        let State::Appending { map: Some(map), .. } = &mut inner.state else {
            unreachable!("ensure_mapped leaves an appending mapping");
        };
        // SAFETY: the mapping covers `need` bytes and only this call writes
        // past `len` (callers serialize ingestion).
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                map.as_mut_ptr().add(inner.len),
                bytes.len(),
            );
        }
        inner.len = need;
        Ok(())
    }

    /// Truncates or extends the spill file to exactly `new_len` bytes; the
    /// extension is zero-filled. `resize(0)` on an unopened buffer succeeds
    /// without creating a spill file.
    pub fn resize(&self, new_len: usize) -> Result<(), BufferError> {
        let mut g = self.inner.lock().unwrap();
        match &mut g.state {
            State::Frozen { .. } => return Err(BufferError::Frozen),
            State::Unopened if new_len == 0 => {
                g.len = 0;
                return Ok(());
            }
            State::Unopened => Self::open_spill(&mut g)?,
            State::Appending { .. } => {}
        }
        let State::Appending {
            file,
            map,
            capacity,
        } = &mut g.state
        else {
            unreachable!();
        };
        *map = None;
        file.set_len(new_len as u64)
            .map_err(BufferError::os("ftruncate"))?;
        *capacity = new_len;
        g.len = new_len;
        Ok(())
    }

    /// Freezes the buffer: truncates the spill file to the logical length,
    /// maps it shared, and drops our file handle. Idempotent; a one-way
    /// transition.
    pub fn freeze(&self) -> Result<(), BufferError> {
        let mut g = self.inner.lock().unwrap();
        Self::freeze_locked(&mut g)
    }

    /// Freezes if needed, advises `MADV_RANDOM`, and returns the raw bytes.
    pub fn lock(&self) -> Result<&[u8], BufferError> {
        let (ptr, len) = self.frozen_parts(Some(libc::MADV_RANDOM))?;
        // SAFETY: frozen mapping, stable until drop; `&self` outlives the
        // returned slice.
        Ok(unsafe { raw_slice(ptr, len) })
    }

    /// Freezes if needed, advises `MADV_SEQUENTIAL`, and returns the raw
    /// bytes.
    pub fn lock_seq(&self) -> Result<&[u8], BufferError> {
        let (ptr, len) = self.frozen_parts(Some(libc::MADV_SEQUENTIAL))?;
        // SAFETY: as in `lock`.
        Ok(unsafe { raw_slice(ptr, len) })
    }

    /// Ends a [`lock`](Self::lock) scope. Advisory only: the access-pattern
    /// hint and page protection are left as they are.
    pub fn unlock(&self) {}

    /// Ends a [`lock_seq`](Self::lock_seq) scope. Advisory only.
    pub fn unlock_seq(&self) {}

    /// Freezes if needed and returns the buffer as a slice of `T`.
    pub fn as_slice<T: PlainData>(&self) -> Result<&[T], BufferError> {
        let (ptr, len) = self.frozen_parts(None)?;
        Ok(unsafe { typed_slice(ptr, len) })
    }

    /// Freezes if needed and returns the buffer as a slice of [`SyncCell`],
    /// for the writes the engine serializes itself.
    pub fn as_sync_slice<T: PlainData>(&self) -> Result<&[SyncCell<T>], BufferError> {
        let (ptr, len) = self.frozen_parts(None)?;
        // SAFETY: `SyncCell<T>` is a transparent wrapper over `T`.
        Ok(unsafe { typed_slice(ptr, len) })
    }

    fn open_spill(g: &mut Inner) -> Result<(), BufferError> {
        use std::os::unix::fs::OpenOptionsExt;
        let path = g.dir.join(SPILL_ID.fetch_add(1, Ordering::Relaxed).to_string());
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(BufferError::os("open"))?;
        g.path = Some(path);
        g.state = State::Appending {
            file,
            map: None,
            capacity: 0,
        };
        Ok(())
    }

    /// Grows the spill file to at least `need` bytes (doubling, minimum 4096)
    /// and (re)maps it writable.
    fn ensure_mapped(g: &mut Inner, need: usize) -> Result<(), BufferError> {
        if matches!(g.state, State::Unopened) {
            Self::open_spill(g)?;
        }
        let State::Appending {
            file,
            map,
            capacity,
        } = &mut g.state
        else {
            unreachable!("frozen buffers are rejected by the callers");
        };
        if *capacity < need {
            let mut new_cap = (*capacity).max(MIN_CAPACITY);
            while new_cap < need {
                new_cap *= 2;
            }
            *map = None;
            file.set_len(new_cap as u64)
                .map_err(BufferError::os("ftruncate"))?;
            *capacity = new_cap;
        }
        if map.is_none() {
            let dup = file.try_clone().map_err(BufferError::os("dup"))?;
            // SAFETY: shared file mapping; the file outlives the map.
            *map = Some(unsafe {
                MmapOptions::new(*capacity)
                    .map_err(BufferError::map("mmap"))?
                    .with_flags(MmapFlags::SHARED)
                    .with_file(&dup, 0)
                    .map_mut()
                    .map_err(BufferError::map("mmap"))?
            });
        }
        Ok(())
    }

    fn freeze_locked(g: &mut Inner) -> Result<(), BufferError> {
        match &g.state {
            State::Frozen { .. } => return Ok(()),
            State::Unopened => {
                g.state = State::Frozen { map: None };
                return Ok(());
            }
            State::Appending { .. } => {}
        }
        let State::Appending { file, .. } = std::mem::replace(&mut g.state, State::Unopened)
        else {
            unreachable!();
        };
        file.set_len(g.len as u64)
            .map_err(BufferError::os("ftruncate"))?;
        let map = if g.len > 0 {
            // SAFETY: shared file mapping, cut to the logical length.
            Some(unsafe {
                MmapOptions::new(g.len)
                    .map_err(BufferError::map("mmap"))?
                    .with_flags(MmapFlags::SHARED)
                    .with_file(&file, 0)
                    .map_mut()
                    .map_err(BufferError::map("mmap"))?
            })
        } else {
            None
        };
        g.state = State::Frozen { map };
        Ok(())
    }

    fn frozen_parts(&self, advice: Option<libc::c_int>) -> Result<(*const u8, usize), BufferError> {
        let mut g = self.inner.lock().unwrap();
        Self::freeze_locked(&mut g)?;
        let State::Frozen { map } = &g.state else {
            unreachable!();
        };
        let ptr = match map {
            Some(m) => m.as_ptr(),
            None => std::ptr::NonNull::<u8>::dangling().as_ptr(),
        };
        if let (Some(advice), Some(m)) = (advice, map.as_ref()) {
            // SAFETY: `m` covers `len` mapped bytes.
            if unsafe { libc::madvise(m.as_ptr() as *mut libc::c_void, g.len, advice) } != 0 {
                return Err(BufferError::os("madvise")(std::io::Error::last_os_error()));
            }
        }
        Ok((ptr, g.len))
    }
}

impl Drop for FileBuffer {
    fn drop(&mut self) {
        let g = match self.inner.get_mut() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Unmap before unlinking.
        g.state = State::Unopened;
        if let Some(path) = g.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("could not remove spill file {}: {}", path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for FileBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.lock().unwrap();
        f.debug_struct("FileBuffer")
            .field("len", &g.len)
            .field("frozen", &matches!(g.state, State::Frozen { .. }))
            .field("path", &g.path)
            .finish()
    }
}

/// # Safety
///
/// `ptr` must point to `len` readable bytes (or be dangling when `len == 0`)
/// that stay valid and unmoved for `'a`.
unsafe fn raw_slice<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    std::slice::from_raw_parts(ptr, len)
}

/// # Safety
///
/// As [`raw_slice`]; additionally `ptr` must be aligned for `T` (mappings are
/// page-aligned) and `len` a multiple of `size_of::<T>()`.
unsafe fn typed_slice<'a, T>(ptr: *const u8, len: usize) -> &'a [T] {
    let size = std::mem::size_of::<T>();
    if size == 0 || len == 0 {
        return &[];
    }
    debug_assert_eq!(len % size, 0);
    debug_assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
    std::slice::from_raw_parts(ptr as *const T, len / size)
}
