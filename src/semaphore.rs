// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A single named, cross-process counting semaphore. Thin wrapper over
// `platform::PlatformSemaphoreSet` opened with exactly one counter.

use std::io;

use crate::platform::PlatformSemaphoreSet;

/// A named, inter-process counting semaphore.
pub struct IpcSemaphore {
    inner: PlatformSemaphoreSet,
}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with the given initial count.
    /// If the name already has backing storage, `initial_count` is ignored —
    /// the existing counter value is used, exactly like `sem_open` with
    /// `O_CREAT` on an already-existing object.
    pub fn open(name: &str, initial_count: u32) -> io::Result<Self> {
        let inner = PlatformSemaphoreSet::open(name, &[initial_count])?;
        Ok(Self { inner })
    }

    /// Decrement the counter. `None` blocks indefinitely; `Some(ms)` blocks
    /// for at most `ms` milliseconds. Returns `Ok(true)` if decremented,
    /// `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        match timeout_ms {
            None => {
                self.inner.acquire(0)?;
                Ok(true)
            }
            Some(ms) => self.inner.acquire_timed(0, ms),
        }
    }

    /// Decrement the counter without blocking. `Ok(false)` means it was
    /// already zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        self.inner.try_acquire(0)
    }

    /// Increment the counter by `n`.
    pub fn post(&self, n: u32) -> io::Result<()> {
        self.inner.release(0, n)
    }

    /// Remove the backing storage for a named semaphore.
    pub fn clear_storage(name: &str) {
        PlatformSemaphoreSet::clear_storage(name);
    }
}
