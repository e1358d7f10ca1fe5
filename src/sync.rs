// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The per-slot paired-token semaphore set: slot `i`'s writable token lives
// at counter `2*i`, its readable token at `2*i+1`, built on
// PlatformSemaphoreSet.

use std::io;
use std::time::Duration;

use crate::platform::PlatformSemaphoreSet;

fn write_sem(i: usize) -> usize {
    2 * i
}

fn read_sem(i: usize) -> usize {
    2 * i + 1
}

/// The `2*slot_count` counters governing a ring: for every slot `i`, counter
/// `2i` is the writable token and `2i+1` is the readable token.
pub struct SlotTokens {
    set: PlatformSemaphoreSet,
    slot_count: usize,
}

impl SlotTokens {
    /// Open (or create) the token set for `slot_count` slots. On creation,
    /// every writable token starts at 1 and every readable token at 0 — all
    /// slots idle and owned by the writer.
    pub fn open(name: &str, slot_count: usize) -> io::Result<Self> {
        let mut initial = Vec::with_capacity(2 * slot_count);
        for _ in 0..slot_count {
            initial.push(1);
            initial.push(0);
        }
        let set = PlatformSemaphoreSet::open(name, &initial)?;
        Ok(Self { set, slot_count })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn acquire_writable(&self, i: usize) -> io::Result<()> {
        self.set.acquire(write_sem(i))
    }

    pub fn try_acquire_writable(&self, i: usize) -> io::Result<bool> {
        self.set.try_acquire(write_sem(i))
    }

    pub fn acquire_writable_timed(&self, i: usize, timeout: Duration) -> io::Result<bool> {
        self.set.acquire_timed(write_sem(i), timeout.as_millis() as u64)
    }

    pub fn release_writable(&self, i: usize) -> io::Result<()> {
        self.set.release(write_sem(i), 1)
    }

    pub fn acquire_readable(&self, i: usize) -> io::Result<()> {
        self.set.acquire(read_sem(i))
    }

    pub fn try_acquire_readable(&self, i: usize) -> io::Result<bool> {
        self.set.try_acquire(read_sem(i))
    }

    pub fn acquire_readable_timed(&self, i: usize, timeout: Duration) -> io::Result<bool> {
        self.set.acquire_timed(read_sem(i), timeout.as_millis() as u64)
    }

    pub fn release_readable(&self, i: usize) -> io::Result<()> {
        self.set.release(read_sem(i), 1)
    }

    /// Remove the token set's backing storage by name (idempotent).
    pub fn destroy_by_name(name: &str) {
        PlatformSemaphoreSet::clear_storage(name);
    }
}
