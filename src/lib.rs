// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A bounded, lossless, single-writer/single-reader ring buffer over shared
// memory, synchronized with per-slot paired counting semaphores.

pub mod shm_name;

mod platform;
mod spin_lock;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod semaphore;
pub use semaphore::IpcSemaphore;

mod key;
pub use key::{Key, KEY_TEXT_MAX_LEN};

mod segment;
mod sync;

mod ring;
pub use ring::{create, remove_by_key, Reader, Writer};
