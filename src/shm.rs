// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory region with bounds-checked access.

use std::io;

use crate::platform::{PlatformShm, ShmMode};

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if it already exists.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

impl From<ShmOpenMode> for ShmMode {
    fn from(mode: ShmOpenMode) -> Self {
        match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        }
    }
}

/// Marker for fixed-layout structs that may be viewed in place at the start
/// of a shared region.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain only atomics and plain integers
/// (so that the all-zero pattern of a fresh segment is a valid value), and
/// never be moved out of the region.
pub unsafe trait ShmLayout: Sized + Sync {}

/// A named, inter-process shared memory region.
///
/// The mapping carries a trailing reference counter shared by every process
/// mapping it; the backing object is unlinked when the last handle drops.
/// Contents are reached only through [`header`](Self::header),
/// [`read_at`](Self::read_at) and [`write_at`](Self::write_at), which check
/// every access against the mapped size.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named region of `size` usable bytes. With
    /// [`ShmOpenMode::Open`], `size` may be 0 to accept the creator's size.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let inner = PlatformShm::acquire(name, size, mode.into())?;
        Ok(Self { inner })
    }

    /// Usable size (excludes the trailing counter).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Total mapped size including the trailing counter.
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// POSIX object name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Number of handles, across all processes, mapping this region.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Whether this handle created the mapping (no other mapper existed).
    pub fn is_first_mapper(&self) -> bool {
        self.inner.prev_ref_count() == 0
    }

    /// Force-remove the backing object. Existing mappings stay valid.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a named region without an open handle.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    /// View the start of the region as `T`.
    pub fn header<T: ShmLayout>(&self) -> io::Result<&T> {
        let ptr = self.inner.as_mut_ptr();
        if std::mem::size_of::<T>() > self.user_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "region {} holds {} bytes, header needs {}",
                    self.name(),
                    self.user_size(),
                    std::mem::size_of::<T>()
                ),
            ));
        }
        if (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "misaligned header"));
        }
        // Safety: size and alignment checked above; ShmLayout guarantees any
        // bit pattern written by a peer is a valid T.
        Ok(unsafe { &*(ptr as *const T) })
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, out.len())?;
        // Safety: range checked against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.inner.as_mut_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.check_range(offset, data.len())?;
        // Safety: range checked against the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.inner.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.user_size() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "access {offset}..+{len} outside region {} of {} bytes",
                    self.name(),
                    self.user_size()
                ),
            )),
        }
    }
}

impl std::fmt::Debug for ShmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmHandle")
            .field("name", &self.name())
            .field("user_size", &self.user_size())
            .finish()
    }
}
