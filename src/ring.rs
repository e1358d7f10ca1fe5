// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The write/read half-state-machines over a Segment + SlotTokens pair, plus
// create/open/close/remove and the ownership/permission/reverse-direction
// operations on the live objects.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::key::Key;
use crate::platform;
use crate::segment::Segment;
use crate::shm::ShmOpenMode;
use crate::sync::SlotTokens;

fn random_name() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;
    let mixed = seed ^ n.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (pid << 32);
    match crate::shm_name::fnv1a_64(&mixed.to_le_bytes()) {
        0 => 1,
        h => h,
    }
}

/// Reject permission bits outside the recognized `rwxrwxrwx` mask; callers
/// of `create`/`chmod` get an explicit error instead of silent truncation.
fn validate_permissions(mode: u32) -> io::Result<()> {
    if mode & !0o777 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "permissions contains bits outside the recognized rwxrwxrwx mask",
        ));
    }
    Ok(())
}

fn is_exists(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::AlreadyExists || e.raw_os_error() == Some(libc_eexist())
}

#[cfg(unix)]
fn libc_eexist() -> i32 {
    libc::EEXIST
}

#[cfg(not(unix))]
fn libc_eexist() -> i32 {
    -1
}

/// Create a fresh, named ring: allocates the segment and the token set under
/// newly chosen random names, initializes the terminal marker to zero and
/// every slot's tokens to `{1, 0}`, and returns the finalized key. On any
/// failure after partial allocation, both objects are torn down and the
/// error is returned, restoring pre-call state.
pub fn create(slot_size: u64, slot_count: u64, permissions: u32) -> io::Result<Key> {
    if slot_count == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "slot_count is 0"));
    }
    if slot_size == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "slot_size is 0"));
    }
    validate_permissions(permissions)?;

    loop {
        let shm_name = random_name();
        let sem_name = random_name();
        let shm_str = shm_name.to_string();
        let sem_str = sem_name.to_string();

        let segment = match Segment::open(
            &shm_str,
            slot_size as usize,
            slot_count as usize,
            ShmOpenMode::Create,
        ) {
            Ok(s) => s,
            Err(e) if is_exists(&e) => continue,
            Err(e) => return Err(e),
        };

        let tokens = match SlotTokens::open(&sem_str, slot_count as usize) {
            Ok(tokens) => tokens,
            Err(e) => {
                drop(segment);
                Segment::destroy_by_name(&shm_str);
                if is_exists(&e) {
                    continue;
                }
                return Err(e);
            }
        };

        if let Err(e) = platform::chmod_by_name(&shm_str, permissions)
            .and_then(|_| platform::chmod_by_name(&sem_str, permissions))
        {
            drop(segment);
            drop(tokens);
            Segment::destroy_by_name(&shm_str);
            SlotTokens::destroy_by_name(&sem_str);
            return Err(e);
        }

        drop(segment);
        drop(tokens);
        return Ok(Key::named(shm_name, sem_name, slot_size, slot_count));
    }
}

fn attach_or_create(key: &Key) -> io::Result<(Key, Segment, SlotTokens)> {
    if key.is_private() {
        loop {
            let shm_name = random_name();
            let sem_name = random_name();
            let shm_str = shm_name.to_string();
            let sem_str = sem_name.to_string();

            let segment = match Segment::open(
                &shm_str,
                key.slot_size as usize,
                key.slot_count as usize,
                ShmOpenMode::Create,
            ) {
                Ok(s) => s,
                Err(e) if is_exists(&e) => continue,
                Err(e) => return Err(e),
            };

            let tokens = match SlotTokens::open(&sem_str, key.slot_count as usize) {
                Ok(tokens) => tokens,
                Err(e) => {
                    drop(segment);
                    Segment::destroy_by_name(&shm_str);
                    if is_exists(&e) {
                        continue;
                    }
                    return Err(e);
                }
            };

            // Private rings are owner-only.
            if let Err(e) = platform::chmod_by_name(&shm_str, 0o600)
                .and_then(|_| platform::chmod_by_name(&sem_str, 0o600))
            {
                drop(segment);
                drop(tokens);
                Segment::destroy_by_name(&shm_str);
                SlotTokens::destroy_by_name(&sem_str);
                return Err(e);
            }

            let resolved = Key::named(shm_name, sem_name, key.slot_size, key.slot_count);
            return Ok((resolved, segment, tokens));
        }
    } else {
        let shm_str = key.shm_name.to_string();
        let sem_str = key.sem_name.to_string();
        let segment = Segment::open(
            &shm_str,
            key.slot_size as usize,
            key.slot_count as usize,
            ShmOpenMode::Open,
        )?;
        let tokens = SlotTokens::open(&sem_str, key.slot_count as usize)?;
        Ok((*key, segment, tokens))
    }
}

fn chown_objects(resolved: &Key, uid: u32, gid: u32) -> io::Result<()> {
    platform::chown_by_name(&resolved.shm_name.to_string(), uid, gid)?;
    platform::chown_by_name(&resolved.sem_name.to_string(), uid, gid)?;
    Ok(())
}

fn chmod_objects(resolved: &Key, mode: u32) -> io::Result<()> {
    validate_permissions(mode)?;
    platform::chmod_by_name(&resolved.shm_name.to_string(), mode)?;
    platform::chmod_by_name(&resolved.sem_name.to_string(), mode)?;
    Ok(())
}

fn stat_objects(resolved: &Key) -> io::Result<(u32, u32, u32)> {
    platform::stat_by_name(&resolved.shm_name.to_string())
}

/// Destroy a ring by key without attaching, ignoring missing objects
/// (idempotent). Private keys have no durable name to look up and are a
/// no-op.
pub fn remove_by_key(key: &Key) {
    if key.is_private() {
        return;
    }
    Segment::destroy_by_name(&key.shm_name.to_string());
    SlotTokens::destroy_by_name(&key.sem_name.to_string());
}

/// The write-side endpoint. Exactly one process should hold this for a
/// given ring at a time: this is a single-producer channel, not a
/// multi-producer one.
pub struct Writer {
    resolved: Key,
    segment: Arc<Segment>,
    tokens: Arc<SlotTokens>,
    cursor: usize,
    reversed: Arc<AtomicBool>,
}

/// The read-side endpoint.
pub struct Reader {
    resolved: Key,
    segment: Arc<Segment>,
    tokens: Arc<SlotTokens>,
    cursor: usize,
    reversed: Arc<AtomicBool>,
}

impl Writer {
    /// Attach to `key`'s ring as the writer. For a private key this creates
    /// both IPC objects (owner-only permissions); for a named key this
    /// attaches to pre-existing objects only.
    pub fn open(key: &Key) -> io::Result<Self> {
        let (resolved, segment, tokens) = attach_or_create(key)?;
        Ok(Self {
            resolved,
            segment: Arc::new(segment),
            tokens: Arc::new(tokens),
            cursor: 0,
            reversed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn slot_count(&self) -> usize {
        self.segment.slot_count()
    }

    /// Acquire the writable token for the current slot (blocking) and
    /// expose its payload region for the caller to fill.
    pub fn write(&self) -> io::Result<&mut [u8]> {
        self.tokens.acquire_writable(self.cursor)?;
        Ok(self.segment.slot_bytes_mut(self.cursor))
    }

    /// Non-blocking variant of `write`. `Ok(None)` means the ring is full
    /// (would-block).
    pub fn try_write(&self) -> io::Result<Option<&mut [u8]>> {
        if self.tokens.try_acquire_writable(self.cursor)? {
            Ok(Some(self.segment.slot_bytes_mut(self.cursor)))
        } else {
            Ok(None)
        }
    }

    /// Bounded-wait variant of `write`. `Ok(None)` means the timeout elapsed
    /// (would-block).
    pub fn write_timed(&self, timeout: Duration) -> io::Result<Option<&mut [u8]>> {
        if self.tokens.acquire_writable_timed(self.cursor, timeout)? {
            Ok(Some(self.segment.slot_bytes_mut(self.cursor)))
        } else {
            Ok(None)
        }
    }

    /// Publish `length` bytes written into the slot exposed by the last
    /// `write`/`try_write`/`write_timed` call, release the readable token,
    /// and advance the cursor.
    pub fn write_done(&mut self, length: usize) -> io::Result<()> {
        if length > self.segment.slot_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length exceeds slot_size",
            ));
        }
        let i = self.cursor;
        self.segment.length_word(i).store(length as u64, Ordering::Release);
        self.tokens.release_readable(i)?;
        self.cursor = (self.cursor + 1) % self.slot_count();
        Ok(())
    }

    /// Stamp the terminal marker with `cursor + 1`. No token is released;
    /// the reader recognizes EOF via the marker comparison in
    /// `Reader::read_done`. The writer must call this exactly once.
    ///
    /// `close` does not itself detach — detachment (and, for the last
    /// handle referencing the segment, destruction) happens when the
    /// `Writer` is dropped, same as any other handle. This split matters
    /// after `reverse_dup` + `fork`: a forked child that only ever reads
    /// the writer side should `std::mem::forget` it rather than drop it,
    /// so the one real detach happens exactly once, in whichever process
    /// keeps the last live handle — merging the stamp into an implicit
    /// drop would force that choice on the caller.
    pub fn close(&mut self) {
        self.segment.stamp_marker(self.cursor as u64 + 1);
    }

    /// Detach then destroy both IPC objects.
    pub fn remove(self) {
        let resolved = self.resolved;
        drop(self);
        Segment::destroy_by_name(&resolved.shm_name.to_string());
        SlotTokens::destroy_by_name(&resolved.sem_name.to_string());
    }

    pub fn chown(&self, uid: u32, gid: u32) -> io::Result<()> {
        chown_objects(&self.resolved, uid, gid)
    }

    pub fn chmod(&self, mode: u32) -> io::Result<()> {
        chmod_objects(&self.resolved, mode)
    }

    pub fn stat(&self) -> io::Result<(u32, u32, u32)> {
        stat_objects(&self.resolved)
    }

    /// Produce the matching reader for this ring, sharing the same IPC
    /// objects, for a process that will fork immediately after. Must not be
    /// called more than once per ring.
    ///
    /// # Panics
    /// Panics if this ring has already been reversed (from either side).
    pub fn reverse_dup(&self) -> Reader {
        let already = self.reversed.swap(true, Ordering::SeqCst);
        assert!(!already, "reverse_dup called more than once on this ring");
        Reader {
            resolved: self.resolved,
            segment: Arc::clone(&self.segment),
            tokens: Arc::clone(&self.tokens),
            cursor: 0,
            reversed: Arc::clone(&self.reversed),
        }
    }
}

impl Reader {
    /// Attach to `key`'s ring as the reader. See `Writer::open` for the
    /// private-vs-named distinction.
    pub fn open(key: &Key) -> io::Result<Self> {
        let (resolved, segment, tokens) = attach_or_create(key)?;
        Ok(Self {
            resolved,
            segment: Arc::new(segment),
            tokens: Arc::new(tokens),
            cursor: 0,
            reversed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn slot_count(&self) -> usize {
        self.segment.slot_count()
    }

    /// Acquire the readable token for the current slot (blocking) and
    /// expose a read-only view of its published bytes.
    pub fn read(&self) -> io::Result<(&[u8], usize)> {
        self.tokens.acquire_readable(self.cursor)?;
        let len = self.segment.length_word(self.cursor).load(Ordering::Acquire) as usize;
        Ok((self.segment.slot_bytes(self.cursor, len), len))
    }

    /// Non-blocking variant of `read`. `Ok(None)` means the ring is empty
    /// (would-block).
    pub fn try_read(&self) -> io::Result<Option<(&[u8], usize)>> {
        if self.tokens.try_acquire_readable(self.cursor)? {
            let len = self.segment.length_word(self.cursor).load(Ordering::Acquire) as usize;
            Ok(Some((self.segment.slot_bytes(self.cursor, len), len)))
        } else {
            Ok(None)
        }
    }

    /// Bounded-wait variant of `read`. `Ok(None)` means the timeout elapsed
    /// (would-block).
    pub fn read_timed(&self, timeout: Duration) -> io::Result<Option<(&[u8], usize)>> {
        if self.tokens.acquire_readable_timed(self.cursor, timeout)? {
            let len = self.segment.length_word(self.cursor).load(Ordering::Acquire) as usize;
            Ok(Some((self.segment.slot_bytes(self.cursor, len), len)))
        } else {
            Ok(None)
        }
    }

    /// Release the writable token for the slot consumed by the last
    /// `read`/`try_read`/`read_timed` call, advance the cursor, and report
    /// whether the writer's terminal marker shows this was the last slot
    /// produced before close. The cursor advances before the marker
    /// comparison — this exact ordering is required to keep the EOF
    /// contract sound.
    pub fn read_done(&mut self) -> io::Result<bool> {
        let i = self.cursor;
        self.tokens.release_writable(i)?;
        self.cursor = (self.cursor + 1) % self.slot_count();
        let marker = self.segment.load_marker();
        Ok(marker == self.cursor as u64 + 1)
    }

    /// Detach then destroy both IPC objects.
    pub fn remove(self) {
        let resolved = self.resolved;
        drop(self);
        Segment::destroy_by_name(&resolved.shm_name.to_string());
        SlotTokens::destroy_by_name(&resolved.sem_name.to_string());
    }

    pub fn chown(&self, uid: u32, gid: u32) -> io::Result<()> {
        chown_objects(&self.resolved, uid, gid)
    }

    pub fn chmod(&self, mode: u32) -> io::Result<()> {
        chmod_objects(&self.resolved, mode)
    }

    pub fn stat(&self) -> io::Result<(u32, u32, u32)> {
        stat_objects(&self.resolved)
    }

    /// Produce the matching writer for this ring. See `Writer::reverse_dup`.
    ///
    /// # Panics
    /// Panics if this ring has already been reversed (from either side).
    pub fn reverse_dup(&self) -> Writer {
        let already = self.reversed.swap(true, Ordering::SeqCst);
        assert!(!already, "reverse_dup called more than once on this ring");
        Writer {
            resolved: self.resolved,
            segment: Arc::clone(&self.segment),
            tokens: Arc::clone(&self.tokens),
            cursor: 0,
            reversed: Arc::clone(&self.reversed),
        }
    }
}
