// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex.

use std::io;
use std::time::Duration;

use crate::platform::PlatformMutex;

/// A named, process-shared, robust mutex.
///
/// The `pthread_mutex_t` lives in its own shared segment; a lock abandoned
/// by a crashed process is recovered by the next locker.
pub struct IpcMutex {
    inner: PlatformMutex,
}

impl IpcMutex {
    /// Open (or create) the mutex called `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        Ok(Self {
            inner: PlatformMutex::open(name)?,
        })
    }

    /// Lock, blocking indefinitely.
    pub fn lock(&self) -> io::Result<()> {
        self.inner.lock()
    }

    /// Lock within `timeout`. `Ok(false)` means the timeout elapsed.
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<bool> {
        self.inner.lock_timeout(timeout.as_millis() as u64)
    }

    /// Lock only if uncontended.
    pub fn try_lock(&self) -> io::Result<bool> {
        self.inner.try_lock()
    }

    pub fn unlock(&self) -> io::Result<()> {
        self.inner.unlock()
    }

    /// Remove the backing segment of a named mutex.
    pub fn clear_storage(name: &str) {
        PlatformMutex::clear_storage(name);
    }

    /// Raw `pthread_mutex_t` pointer, for `pthread_cond_*wait`.
    pub(crate) fn native_mutex_ptr(&self) -> *mut u8 {
        self.inner.native_ptr()
    }
}
