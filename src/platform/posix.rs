// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the shared-memory mapping and the counting
// semaphore set used by the cross-platform ring.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Process-local shm cache — mirrors C++ `curr_prog` in posix/mutex.h.
// All threads within the same process that open the same named mutex or
// condition variable MUST use the same mmap.  macOS's pthread implementation
// stores internal pointers relative to the virtual address used for
// pthread_mutex_init, so a second mmap of the same physical page at a
// different address causes EINVAL on pthread_mutex_lock.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    pub(crate) local_ref: AtomicUsize,
}

pub(crate) struct ShmCache {
    map: HashMap<String, Arc<CachedShm>>,
}

impl ShmCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

pub(crate) fn sem_cache() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::new()))
}

/// Acquire or reuse a cached shm handle.
///
/// If this is the first local open for `name`, `init_fn` is called with the
/// shm pointer **while the cache lock is still held**, ensuring that no other
/// thread can use the handle before initialisation completes.
pub(crate) fn cached_shm_acquire<F>(
    cache: &Mutex<ShmCache>,
    name: &str,
    size: usize,
    init_fn: F,
) -> io::Result<Arc<CachedShm>>
where
    F: FnOnce(*mut u8) -> io::Result<()>,
{
    let mut c = cache.lock().unwrap();
    if let Some(entry) = c.map.get(name) {
        entry.local_ref.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let shm = PlatformShm::acquire(name, size, ShmMode::CreateOrOpen)?;
    let is_creator = shm.prev_ref_count() == 0;
    if is_creator {
        init_fn(shm.as_mut_ptr())?;
    }
    let entry = Arc::new(CachedShm {
        shm,
        local_ref: AtomicUsize::new(1),
    });
    c.map.insert(name.to_string(), Arc::clone(&entry));
    Ok(entry)
}

/// Release one local reference.  When the last local ref drops, remove from cache.
pub(crate) fn cached_shm_release(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = cache.lock().unwrap();
    if let Some(entry) = c.map.get(name) {
        let prev = entry.local_ref.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            c.map.remove(name);
        }
    }
}

/// Forcibly remove a cache entry (used by `clear_storage` to avoid stale
/// entries after the underlying shm has been unlinked).
pub(crate) fn cached_shm_purge(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = cache.lock().unwrap();
    c.map.remove(name);
}

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by `libc` crate on all platforms.
// On macOS robust mutexes are not used (matching the C++ implementation).
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout helpers — must match C++ calc_size() and acc_of()
// ---------------------------------------------------------------------------

/// Mirrors C++ `calc_size()`: rounds up to `alignof(info_t)` then appends
/// an `atomic<int32_t>` reference counter at the end.
/// `alignof(info_t)` == `alignof(atomic<int32_t>)` == 4.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Returns a reference to the trailing `AtomicI32` ref-counter inside a mapped
/// region of `total_size` bytes starting at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm — POSIX shared memory
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter)
    user_size: usize, // user-requested size
    name: String,     // POSIX name (with leading '/')
    prev_ref: i32,    // ref count *before* our fetch_add (0 means we were first)
}

// Safety: the shared memory region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

/// Open mode flags — mirrors C++ `ipc::shm::create` / `ipc::shm::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

impl PlatformShm {
    /// Acquire a named shared memory region, binary-compatible with C++ `ipc::shm::acquire`
    /// + `ipc::shm::get_mem`.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666; // S_IRUSR|S_IWUSR|S_IRGRP|S_IWGRP|S_IROTH|S_IWOTH
        let total_size = calc_size(user_size);

        // For CreateOrOpen: try exclusive create first so we only call ftruncate
        // when we actually own the new object.  On macOS, calling ftruncate on an
        // already-sized shm object can zero its contents before returning EINVAL.
        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                // Try exclusive create first.
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    // We created it — must truncate to set the size.
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    // Already exists — open without truncation.
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        // Ensure permissions (mirrors fchmod in C++)
        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        Self::mmap_and_finish(fd, total_size, user_size, posix_name)
    }

    fn mmap_and_finish(
        fd: i32,
        total_size: usize,
        user_size: usize,
        posix_name: String,
    ) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Increment the reference counter (mirrors C++ get_mem)
        let prev = unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            name: posix_name,
            prev_ref: prev,
        })
    }

    /// Pointer to the user-visible region (excluding the trailing ref counter).
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable pointer to the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Total mapped size (including ref counter).
    pub fn mapped_size(&self) -> usize {
        self.size
    }

    /// User-requested size.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ref count value *before* our own increment during acquire.
    /// Returns 0 if this handle was the first to map the segment.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    /// Current reference count.
    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Force-remove the backing file (shm_unlink). Does NOT release the mapping.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unlink a named shm segment by name (static helper).
    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // Decrement ref counter; if we're the last, also unlink.
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSemaphoreSet — a named set of counting semaphores in shared memory.
//
// macOS does not implement unnamed POSIX semaphores (sem_init returns
// ENOSYS), so the counters here are built from a pthread_mutex_t and a
// pthread_cond_t embedded in shared memory with PTHREAD_PROCESS_SHARED,
// guarding a plain array of i64 counters. A single release/acquire on
// counter `idx` never touches
// any other counter's value; the shared condvar is broadcast on every
// release so every waiter re-checks its own counter.
// ---------------------------------------------------------------------------

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn sem_layout(count: usize) -> (usize, usize, usize, usize) {
    let mutex_off = 0usize;
    let cond_off = align_up(
        mutex_off + std::mem::size_of::<libc::pthread_mutex_t>(),
        std::mem::align_of::<libc::pthread_cond_t>(),
    );
    let counters_off = align_up(
        cond_off + std::mem::size_of::<libc::pthread_cond_t>(),
        std::mem::align_of::<i64>(),
    );
    let total = counters_off + count * std::mem::size_of::<i64>();
    (mutex_off, cond_off, counters_off, total)
}

pub struct PlatformSemaphoreSet {
    cached: Arc<CachedShm>,
    name: String,
    count: usize,
    counters_off: usize,
}

impl PlatformSemaphoreSet {
    /// Open (or create) a named counter set. `initial` gives the starting
    /// value of each counter; its length is the counter count.
    pub fn open(name: &str, initial: &[u32]) -> io::Result<Self> {
        let count = initial.len();
        let (mutex_off, cond_off, counters_off, total) = sem_layout(count);

        let cached = cached_shm_acquire(sem_cache(), name, total, |base| {
            unsafe {
                let mtx_ptr = base.add(mutex_off) as *mut libc::pthread_mutex_t;
                ptr::write_bytes(mtx_ptr, 0, 1);
                let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
                let mut eno = libc::pthread_mutexattr_init(&mut mattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_mutexattr_destroy(&mut mattr);
                    return Err(io::Error::from_raw_os_error(eno));
                }
                #[cfg(not(target_os = "macos"))]
                {
                    eno = pthread_mutexattr_setrobust(&mut mattr, PTHREAD_MUTEX_ROBUST);
                    if eno != 0 {
                        libc::pthread_mutexattr_destroy(&mut mattr);
                        return Err(io::Error::from_raw_os_error(eno));
                    }
                }
                eno = libc::pthread_mutex_init(mtx_ptr, &mattr);
                libc::pthread_mutexattr_destroy(&mut mattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }

                let cond_ptr = base.add(cond_off) as *mut libc::pthread_cond_t;
                ptr::write_bytes(cond_ptr, 0, 1);
                let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
                eno = libc::pthread_condattr_init(&mut cattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
                if eno != 0 {
                    libc::pthread_condattr_destroy(&mut cattr);
                    return Err(io::Error::from_raw_os_error(eno));
                }
                eno = libc::pthread_cond_init(cond_ptr, &cattr);
                libc::pthread_condattr_destroy(&mut cattr);
                if eno != 0 {
                    return Err(io::Error::from_raw_os_error(eno));
                }

                let counters = base.add(counters_off) as *mut i64;
                for (i, &v) in initial.iter().enumerate() {
                    ptr::write(counters.add(i), v as i64);
                }
            }
            Ok(())
        })?;

        Ok(Self {
            cached,
            name: name.to_string(),
            count,
            counters_off,
        })
    }

    /// Number of counters in this set.
    pub fn count(&self) -> usize {
        self.count
    }

    fn base(&self) -> *mut u8 {
        self.cached.shm.as_mut_ptr()
    }

    fn mtx_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.base() as *mut libc::pthread_mutex_t
    }

    fn cond_ptr(&self) -> *mut libc::pthread_cond_t {
        let (_, cond_off, _, _) = sem_layout(self.count);
        unsafe { self.base().add(cond_off) as *mut libc::pthread_cond_t }
    }

    fn counter_ptr(&self, idx: usize) -> *mut i64 {
        debug_assert!(idx < self.count);
        unsafe { (self.base().add(self.counters_off) as *mut i64).add(idx) }
    }

    fn lock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_lock(self.mtx_ptr()) };
        match eno {
            0 => Ok(()),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.mtx_ptr()) };
                if eno2 != 0 {
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    fn unlock(&self) {
        unsafe { libc::pthread_mutex_unlock(self.mtx_ptr()) };
    }

    /// Decrement counter `idx`; block until it is positive.
    pub fn acquire(&self, idx: usize) -> io::Result<()> {
        self.lock()?;
        unsafe {
            while *self.counter_ptr(idx) == 0 {
                let eno = libc::pthread_cond_wait(self.cond_ptr(), self.mtx_ptr());
                if eno != 0 {
                    self.unlock();
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
            *self.counter_ptr(idx) -= 1;
        }
        self.unlock();
        Ok(())
    }

    /// Decrement counter `idx` without blocking. `Ok(false)` means it was
    /// already zero (would-block).
    pub fn try_acquire(&self, idx: usize) -> io::Result<bool> {
        self.lock()?;
        let got = unsafe {
            if *self.counter_ptr(idx) > 0 {
                *self.counter_ptr(idx) -= 1;
                true
            } else {
                false
            }
        };
        self.unlock();
        Ok(got)
    }

    /// Decrement counter `idx`, blocking for at most `timeout_ms`.
    pub fn acquire_timed(&self, idx: usize, timeout_ms: u64) -> io::Result<bool> {
        use std::time::{SystemTime, UNIX_EPOCH};

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let deadline = now + std::time::Duration::from_millis(timeout_ms);
        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };

        self.lock()?;
        unsafe {
            while *self.counter_ptr(idx) == 0 {
                let eno = libc::pthread_cond_timedwait(self.cond_ptr(), self.mtx_ptr(), &ts);
                if eno == libc::ETIMEDOUT {
                    self.unlock();
                    return Ok(false);
                }
                if eno != 0 {
                    self.unlock();
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }
            *self.counter_ptr(idx) -= 1;
        }
        self.unlock();
        Ok(true)
    }

    /// Increment counter `idx` by `n` and wake any waiters.
    pub fn release(&self, idx: usize, n: u32) -> io::Result<()> {
        self.lock()?;
        unsafe {
            *self.counter_ptr(idx) += n as i64;
        }
        unsafe { libc::pthread_cond_broadcast(self.cond_ptr()) };
        self.unlock();
        Ok(())
    }

    /// Remove the shared memory backing a named counter set.
    pub fn clear_storage(name: &str) {
        cached_shm_purge(sem_cache(), name);
        PlatformShm::unlink_by_name(name);
    }
}

impl Drop for PlatformSemaphoreSet {
    fn drop(&mut self) {
        // Never destroy the pthread primitives explicitly (macOS may recycle
        // the virtual address to a different shm segment after munmap); just
        // drop our local reference. The backing shm's own Drop reclaims the
        // mapping (and unlinks on last ref).
        cached_shm_release(sem_cache(), &self.name);
    }
}

// ---------------------------------------------------------------------------
// Admin helpers — chown/chmod/stat on a named shm object by reopening it.
//
// Both the data segment and the semaphore-set segment are POSIX shm objects,
// so ownership/permission changes reopen the object by name to get a
// transient fd, exactly mirroring the fchmod call already in
// `PlatformShm::acquire`.
// ---------------------------------------------------------------------------

/// Promote any read/write/execute bit granted to a class to full read+write
/// for that class; execute bits are always cleared.
pub fn normalize_permissions(mode: u32) -> u32 {
    const RWX: u32 = 0o7;
    let mut out = 0u32;
    for shift in [6, 3, 0] {
        let class = (mode >> shift) & RWX;
        if class != 0 {
            out |= 0o6 << shift; // read + write, no execute
        }
    }
    out
}

fn reopen_fd(name: &str) -> io::Result<i32> {
    let posix_name = shm_name::make_shm_name(name);
    let c_name = CString::new(posix_name.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn chown_by_name(name: &str, uid: u32, gid: u32) -> io::Result<()> {
    let fd = reopen_fd(name)?;
    let ret = unsafe { libc::fchown(fd, uid, gid) };
    unsafe { libc::close(fd) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn chmod_by_name(name: &str, mode: u32) -> io::Result<()> {
    let fd = reopen_fd(name)?;
    let ret = unsafe { libc::fchmod(fd, normalize_permissions(mode) as libc::mode_t) };
    unsafe { libc::close(fd) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Returns `(uid, gid, permission_bits)`.
pub fn stat_by_name(name: &str) -> io::Result<(u32, u32, u32)> {
    let fd = reopen_fd(name)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut st) };
    unsafe { libc::close(fd) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((st.st_uid, st.st_gid, (st.st_mode & 0o777) as u32))
}
