// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process condition variable: a PTHREAD_PROCESS_SHARED
// pthread_cond_t in its own shared segment.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::platform::posix::{self, CachedShm};
use crate::IpcMutex;

/// A named, process-shared condition variable.
pub struct IpcCondition {
    cached: Arc<CachedShm>,
    name: String,
}

impl IpcCondition {
    /// Open (or create) the condition variable called `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        let size = std::mem::size_of::<libc::pthread_cond_t>();
        let cached = posix::cached_shm_acquire(posix::cond_cache(), name, size, |base| unsafe {
            init_shared_cond(base as *mut libc::pthread_cond_t)
        })?;
        Ok(Self {
            cached,
            name: name.to_owned(),
        })
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.cached.shm.as_mut_ptr() as *mut libc::pthread_cond_t
    }

    /// Wait with `mtx` held; the mutex is released for the duration of the
    /// wait and re-acquired before returning. `Ok(false)` on timeout.
    /// Spurious wakeups return `Ok(true)`; callers re-check their predicate.
    pub fn wait(&self, mtx: &IpcMutex, timeout: Option<Duration>) -> io::Result<bool> {
        let mtx_ptr = mtx.native_mutex_ptr() as *mut libc::pthread_mutex_t;
        let eno = match timeout {
            None => unsafe { libc::pthread_cond_wait(self.raw(), mtx_ptr) },
            Some(t) => {
                let ts = posix::realtime_deadline(t.as_millis() as u64);
                unsafe { libc::pthread_cond_timedwait(self.raw(), mtx_ptr, &ts) }
            }
        };
        match eno {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    /// Wake one waiter.
    pub fn notify(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_cond_signal(self.raw()) })
    }

    /// Wake all waiters.
    pub fn broadcast(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_cond_broadcast(self.raw()) })
    }

    /// Remove the backing segment of a named condition variable.
    pub fn clear_storage(name: &str) {
        posix::cached_shm_purge(posix::cond_cache(), name);
        posix::PlatformShm::unlink_by_name(name);
    }
}

impl Drop for IpcCondition {
    fn drop(&mut self) {
        posix::cached_shm_release(posix::cond_cache(), &self.name);
    }
}

fn check(eno: libc::c_int) -> io::Result<()> {
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// # Safety
/// `cond` must point to writable memory large enough for a `pthread_cond_t`.
unsafe fn init_shared_cond(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    std::ptr::write_bytes(cond, 0, 1);

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    let eno = libc::pthread_condattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    let mut eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno == 0 {
        eno = libc::pthread_cond_init(cond, &attr);
    }
    libc::pthread_condattr_destroy(&mut attr);
    check(eno)
}
