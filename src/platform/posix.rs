// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory segments and process-shared pthread mutexes.
//
// Every segment carries a trailing `AtomicI32` reference counter shared by
// all processes mapping it; the last handle to go away unlinks the object.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Process-local segment cache
//
// Threads of one process that open the same named mutex or condition variable
// must share one mapping: some pthread implementations record the virtual
// address used at init time and reject a second mapping of the same page.
// ---------------------------------------------------------------------------

pub(crate) struct CachedShm {
    pub(crate) shm: PlatformShm,
    local_ref: AtomicUsize,
}

#[derive(Default)]
pub(crate) struct ShmCache {
    map: HashMap<String, Arc<CachedShm>>,
}

fn lock_cache(cache: &Mutex<ShmCache>) -> MutexGuard<'_, ShmCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn mutex_cache() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::default()))
}

pub(crate) fn cond_cache() -> &'static Mutex<ShmCache> {
    static CACHE: OnceLock<Mutex<ShmCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ShmCache::default()))
}

/// Map `name` once per process. `init_fn` runs on the fresh memory of the
/// first mapper system-wide, while the cache lock is held.
pub(crate) fn cached_shm_acquire<F>(
    cache: &Mutex<ShmCache>,
    name: &str,
    size: usize,
    init_fn: F,
) -> io::Result<Arc<CachedShm>>
where
    F: FnOnce(*mut u8) -> io::Result<()>,
{
    let mut c = lock_cache(cache);
    if let Some(entry) = c.map.get(name) {
        entry.local_ref.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::clone(entry));
    }
    let shm = PlatformShm::acquire(name, size, ShmMode::CreateOrOpen)?;
    if shm.prev_ref_count() == 0 {
        init_fn(shm.as_mut_ptr())?;
    }
    let entry = Arc::new(CachedShm {
        shm,
        local_ref: AtomicUsize::new(1),
    });
    c.map.insert(name.to_owned(), Arc::clone(&entry));
    Ok(entry)
}

pub(crate) fn cached_shm_release(cache: &Mutex<ShmCache>, name: &str) {
    let mut c = lock_cache(cache);
    let last = match c.map.get(name) {
        Some(entry) => entry.local_ref.fetch_sub(1, Ordering::AcqRel) <= 1,
        None => false,
    };
    if last {
        c.map.remove(name);
    }
}

pub(crate) fn cached_shm_purge(cache: &Mutex<ShmCache>, name: &str) {
    lock_cache(cache).map.remove(name);
}

// ---------------------------------------------------------------------------
// Robust mutex symbols (not exported by `libc` everywhere)
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
    fn pthread_mutex_timedlock(
        mutex: *mut libc::pthread_mutex_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

// ---------------------------------------------------------------------------
// Segment layout: [user bytes, padded to 4][AtomicI32 ref counter]
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();
const COUNTER_SIZE: usize = std::mem::size_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    user_size.div_ceil(ALIGN) * ALIGN + COUNTER_SIZE
}

/// # Safety
/// `mem` must point to a live mapping of at least `total_size` bytes.
unsafe fn ref_counter<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    &*(mem.add(total_size - COUNTER_SIZE) as *const AtomicI32)
}

fn c_name_of(posix_name: &str) -> io::Result<CString> {
    CString::new(posix_name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct PlatformShm {
    mem: *mut u8,
    total_size: usize,
    user_size: usize,
    name: String,
    prev_ref: i32,
}

// Safety: the mapping is process-shared memory; all mutation goes through
// atomics or an external lock.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Map a named segment. With [`ShmMode::Open`] a `user_size` of 0 means
    /// "use the size the creator gave it".
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 && mode != ShmMode::Open {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = c_name_of(&posix_name)?;
        let perms: libc::mode_t = 0o666;

        let open = |flags: libc::c_int| -> io::Result<libc::c_int> {
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, perms as libc::c_uint) };
            if fd == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        };
        let exclusive = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

        // Only the creator truncates: resizing an existing object may wipe it.
        let (fd, created) = match mode {
            ShmMode::Create => (open(exclusive)?, true),
            ShmMode::Open => (open(libc::O_RDWR)?, false),
            ShmMode::CreateOrOpen => match open(exclusive) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (open(libc::O_RDWR)?, false),
                Err(e) => return Err(e),
            },
        };

        unsafe { libc::fchmod(fd, perms) };

        let total_size = if created {
            let total = calc_size(user_size);
            if unsafe { libc::ftruncate(fd, total as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            total
        } else {
            match Self::existing_size(fd) {
                Ok(existing) if existing > COUNTER_SIZE => {
                    if user_size != 0 && existing < calc_size(user_size) {
                        unsafe { libc::close(fd) };
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("segment {posix_name} is {existing} bytes, need {}", calc_size(user_size)),
                        ));
                    }
                    existing
                }
                Ok(_) => {
                    unsafe { libc::close(fd) };
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("segment {posix_name} is not sized yet"),
                    ));
                }
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            }
        };

        Self::map(fd, total_size, posix_name)
    }

    fn existing_size(fd: libc::c_int) -> io::Result<usize> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st.st_size as usize)
    }

    fn map(fd: libc::c_int, total_size: usize, posix_name: String) -> io::Result<Self> {
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
        let mem = mem as *mut u8;
        let prev_ref = unsafe { ref_counter(mem, total_size).fetch_add(1, Ordering::AcqRel) };
        Ok(Self {
            mem,
            total_size,
            user_size: total_size - COUNTER_SIZE,
            name: posix_name,
            prev_ref,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.total_size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference count observed before this handle's own increment; 0 means
    /// this handle mapped the segment first.
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { ref_counter(self.mem, self.total_size).load(Ordering::Acquire) }
    }

    pub fn unlink(&self) {
        if let Ok(c_name) = c_name_of(&self.name) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = c_name_of(&shm_name::make_shm_name(name)) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        let prev = unsafe { ref_counter(self.mem, self.total_size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.total_size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex: pthread_mutex_t living in its own named segment
// ---------------------------------------------------------------------------

pub struct PlatformMutex {
    cached: Arc<CachedShm>,
    name: String,
}

impl PlatformMutex {
    pub fn open(name: &str) -> io::Result<Self> {
        let size = std::mem::size_of::<libc::pthread_mutex_t>();
        let cached = cached_shm_acquire(mutex_cache(), name, size, |base| unsafe {
            init_shared_mutex(base as *mut libc::pthread_mutex_t)
        })?;
        Ok(Self {
            cached,
            name: name.to_owned(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_mutex_t
    }

    /// Turn a pthread return code into a lock outcome, repairing the mutex
    /// when its previous owner died while holding it.
    fn settle(&self, eno: libc::c_int) -> io::Result<bool> {
        match eno {
            0 => Ok(true),
            libc::EBUSY | libc::ETIMEDOUT => Ok(false),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.raw()) };
                if eno2 != 0 {
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                tracing::warn!(mutex = %self.name, "recovered mutex abandoned by a dead owner");
                Ok(true)
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub fn lock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_lock(self.raw()) };
        self.settle(eno).map(|_| ())
    }

    /// `Ok(false)` when the timeout elapsed first.
    pub fn lock_timeout(&self, timeout_ms: u64) -> io::Result<bool> {
        #[cfg(target_os = "macos")]
        {
            let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
            let mut k = 0u32;
            loop {
                if self.try_lock()? {
                    return Ok(true);
                }
                if std::time::Instant::now() >= deadline {
                    return Ok(false);
                }
                crate::backoff::adaptive_yield(&mut k);
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            let ts = realtime_deadline(timeout_ms);
            loop {
                let eno = unsafe { pthread_mutex_timedlock(self.raw(), &ts) };
                if eno == libc::EINTR {
                    continue;
                }
                return self.settle(eno);
            }
        }
    }

    pub fn try_lock(&self) -> io::Result<bool> {
        let eno = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        self.settle(eno)
    }

    pub fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    pub(crate) fn native_ptr(&self) -> *mut u8 {
        self.cached.shm.as_mut_ptr()
    }

    pub fn clear_storage(name: &str) {
        cached_shm_purge(mutex_cache(), name);
        PlatformShm::unlink_by_name(name);
    }
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        // No pthread_mutex_destroy: other processes may still hold the
        // segment, and munmap + unlink reclaims it once they are gone.
        cached_shm_release(mutex_cache(), &self.name);
    }
}

/// # Safety
/// `mtx` must point to writable memory large enough for a `pthread_mutex_t`.
unsafe fn init_shared_mutex(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    let mut eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    #[cfg(not(target_os = "macos"))]
    if eno == 0 {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
    }
    if eno == 0 {
        eno = libc::pthread_mutex_init(mtx, &attr);
    }
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Absolute CLOCK_REALTIME deadline `timeout_ms` from now, as the pthread
/// timed waits expect.
pub(crate) fn realtime_deadline(timeout_ms: u64) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let ns_total = ts.tv_nsec as u64 + (timeout_ms % 1000) * 1_000_000;
    ts.tv_sec += (timeout_ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
    ts
}

/// Nanoseconds on CLOCK_MONOTONIC. The clock is system-wide, so stamps taken
/// in different processes on one host are comparable.
pub(crate) fn monotonic_nanos() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub(crate) fn current_pid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_size_pads_and_appends_counter() {
        assert_eq!(calc_size(1), 8);
        assert_eq!(calc_size(4), 8);
        assert_eq!(calc_size(5), 12);
        assert_eq!(calc_size(1024), 1028);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }
}
