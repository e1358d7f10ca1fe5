// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shared-memory segment backing a ring, built on ShmHandle. Unlike the
// platform mutex/semaphore helpers that cache a process-local mmap behind a
// name, the segment itself is the unit the caller holds.
//
// Layout: one AtomicU64 terminal marker, then `slot_count` slots each
// consisting of `slot_size` payload bytes padded up to an 8-byte stride
// boundary followed by an AtomicU64 length word. The padding keeps every
// length word (and the following slot's payload) naturally aligned for
// AtomicU64 regardless of `slot_size`.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::shm::{ShmHandle, ShmOpenMode};

const MARKER_SIZE: usize = std::mem::size_of::<AtomicU64>();
const WORD_ALIGN: usize = std::mem::align_of::<AtomicU64>();

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn slot_stride(slot_size: usize) -> usize {
    align_up(slot_size, WORD_ALIGN) + MARKER_SIZE
}

/// Total mapped size of a segment with the given capacities.
pub fn segment_size(slot_size: usize, slot_count: usize) -> usize {
    MARKER_SIZE + slot_count * slot_stride(slot_size)
}

/// The shared-memory segment backing one ring: a terminal marker followed by
/// `slot_count` slots of `slot_size` bytes, each with a trailing length word.
pub struct Segment {
    shm: ShmHandle,
    slot_size: usize,
    slot_count: usize,
}

impl Segment {
    /// Attach to (or create) a segment named `name` sized for `slot_size` /
    /// `slot_count`. The terminal marker starts zeroed — POSIX `shm_open` /
    /// Windows `CreateFileMappingW` both zero-fill freshly allocated pages,
    /// so no explicit initialization is needed beyond sizing the mapping.
    pub fn open(name: &str, slot_size: usize, slot_count: usize, mode: ShmOpenMode) -> io::Result<Self> {
        if slot_count == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "slot_count is 0"));
        }
        if slot_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "slot_size is 0"));
        }
        let size = segment_size(slot_size, slot_count);
        let shm = ShmHandle::acquire(name, size, mode)?;
        Ok(Self {
            shm,
            slot_size,
            slot_count,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn slot_offset(&self, i: usize) -> usize {
        debug_assert!(i < self.slot_count);
        MARKER_SIZE + i * slot_stride(self.slot_size)
    }

    /// The terminal marker: zero until the writer closes, then
    /// `writer_cursor_at_close + 1`.
    pub fn marker(&self) -> &AtomicU64 {
        unsafe { &*(self.shm.as_ptr() as *const AtomicU64) }
    }

    /// Writer-only bounded view of slot `i`'s payload region.
    pub fn slot_bytes_mut(&self, i: usize) -> &mut [u8] {
        let off = self.slot_offset(i);
        unsafe { std::slice::from_raw_parts_mut(self.shm.as_mut_ptr().add(off), self.slot_size) }
    }

    /// Reader-only bounded view of the first `len` bytes of slot `i`'s
    /// payload region. `len` must not exceed `slot_size`.
    pub fn slot_bytes(&self, i: usize, len: usize) -> &[u8] {
        debug_assert!(len <= self.slot_size);
        let off = self.slot_offset(i);
        unsafe { std::slice::from_raw_parts(self.shm.as_ptr().add(off), len) }
    }

    /// Slot `i`'s length word, written by the writer and read by the reader
    /// only after the readable token has transferred.
    pub fn length_word(&self, i: usize) -> &AtomicU64 {
        let off = self.slot_offset(i) + align_up(self.slot_size, WORD_ALIGN);
        unsafe { &*(self.shm.as_mut_ptr().add(off) as *const AtomicU64) }
    }

    /// Stamp the terminal marker. The writer calls this exactly once, on
    /// close, before detaching.
    pub fn stamp_marker(&self, value: u64) {
        self.marker().store(value, Ordering::Release);
    }

    /// Load the terminal marker.
    pub fn load_marker(&self) -> u64 {
        self.marker().load(Ordering::Acquire)
    }

    /// Remove the segment's backing storage by name, ignoring missing
    /// objects (idempotent).
    pub fn destroy_by_name(name: &str) {
        ShmHandle::unlink_by_name(name);
    }
}
