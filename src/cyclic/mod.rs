// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Record-oriented cyclic byte buffer in a named shared memory segment.
//
// Segment layout:
//
//   [ CyclicHeader (64 bytes) ][ capacity data bytes ]
//
// Cursors are monotonically increasing byte positions; the data offset of a
// position is `pos % capacity`. `write - read` is the occupied length, which
// only ever covers whole records: the sole writer publishes a record by
// advancing `write` after copying all of it.
//
// All access goes through `BufferGuard`, obtained from `lock`, which holds the
// buffer's named process-shared mutex.

mod eviction;
mod guard;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use eviction::{EvictionPolicy, RingView, WholeRecordEviction};
pub use guard::{BufferGuard, DropReason, PopOutcome, WriteOutcome};

use crate::backoff::adaptive_yield;
use crate::codec::{LEN_PREFIX, MAX_BODY, MIN_ENVELOPE_LEN};
use crate::error::{Result, TransportError};
use crate::shm::{ShmHandle, ShmLayout, ShmOpenMode};
use crate::IpcMutex;

const MAGIC: u32 = 0x4447_5242;

/// How many times to retry mapping a segment whose creator has not sized it yet.
const SIZE_RETRIES: u32 = 64;

#[repr(C)]
pub(crate) struct CyclicHeader {
    magic: AtomicU32,
    capacity: AtomicU32,
    overwrite: AtomicU32,
    min_body: AtomicU32,
    read: AtomicU64,
    write: AtomicU64,
    records_written: AtomicU64,
    records_rejected: AtomicU64,
    bytes_evicted: AtomicU64,
    corrupt_flushes: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<CyclicHeader>() == 64);

// Safety: repr(C), atomics only, all-zero is the "uninitialised" state.
unsafe impl ShmLayout for CyclicHeader {}

const HEADER_SIZE: usize = std::mem::size_of::<CyclicHeader>();

/// Notified on the writer's thread after every successful write.
pub trait DataListener: Send + Sync {
    fn data_available(&self);
}

/// Creation parameters of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Data bytes available for records.
    pub capacity: usize,
    /// Evict old records instead of refusing new ones when full.
    pub overwrite_on_full: bool,
    /// Smallest plausible record body; shorter length prefixes mark corruption.
    pub min_body: usize,
}

impl BufferOptions {
    pub const fn new(capacity: usize, overwrite_on_full: bool) -> Self {
        Self {
            capacity,
            overwrite_on_full,
            min_body: MIN_ENVELOPE_LEN,
        }
    }

    pub const fn min_body(mut self, min_body: usize) -> Self {
        self.min_body = min_body;
        self
    }
}

/// Counters kept in the shared header, readable without the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub records_written: u64,
    pub records_rejected: u64,
    pub bytes_evicted: u64,
    pub corrupt_flushes: u64,
    pub used: usize,
}

/// A named cyclic buffer of length-prefixed records.
///
/// One writer at a time appends records under [`lock`](Self::lock); when the
/// buffer is full the [`EvictionPolicy`] decides which old records to drop
/// (with overwrite enabled) or the reservation is cut short (without).
pub struct CyclicBuffer {
    name: String,
    shm: ShmHandle,
    lock: IpcMutex,
    capacity: usize,
    overwrite_on_full: bool,
    min_body: usize,
    policy: Box<dyn EvictionPolicy>,
    listener: Option<Arc<dyn DataListener>>,
}

impl CyclicBuffer {
    /// Create the buffer, or attach to it if it already exists.
    pub fn create(name: &str, capacity: usize, overwrite_on_full: bool) -> Result<Self> {
        Self::create_with(name, BufferOptions::new(capacity, overwrite_on_full))
    }

    /// Create or attach with explicit options. When attaching, the
    /// creator's capacity and policy flags win.
    pub fn create_with(name: &str, opts: BufferOptions) -> Result<Self> {
        if opts.capacity < LEN_PREFIX + opts.min_body || opts.capacity > u32::MAX as usize {
            return Err(TransportError::Config(format!(
                "capacity {} of buffer {name} is out of range",
                opts.capacity
            )));
        }
        let shm = map_with_retry(name, HEADER_SIZE + opts.capacity, ShmOpenMode::CreateOrOpen)?;
        let lock = IpcMutex::open(&lock_name(name))?;

        lock.lock()?;
        let init = shm.header::<CyclicHeader>().map(|hdr| {
            if hdr.magic.load(Ordering::Acquire) != MAGIC {
                hdr.capacity.store(opts.capacity as u32, Ordering::Relaxed);
                hdr.overwrite.store(opts.overwrite_on_full as u32, Ordering::Relaxed);
                hdr.min_body.store(opts.min_body as u32, Ordering::Relaxed);
                hdr.read.store(0, Ordering::Relaxed);
                hdr.write.store(0, Ordering::Relaxed);
                hdr.magic.store(MAGIC, Ordering::Release);
                tracing::debug!(buffer = name, capacity = opts.capacity, "created cyclic buffer");
            }
        });
        lock.unlock()?;
        init?;

        Self::from_parts(name, shm, lock)
    }

    /// Attach to an existing, initialised buffer.
    pub fn open(name: &str) -> Result<Self> {
        let shm = map_with_retry(name, 0, ShmOpenMode::Open)?;
        let lock = IpcMutex::open(&lock_name(name))?;
        Self::from_parts(name, shm, lock)
    }

    /// Attach to the buffer if a peer already set it up (keeping the peer's
    /// geometry), otherwise create it with `opts`.
    pub fn open_or_create(name: &str, opts: BufferOptions) -> Result<Self> {
        let mut k = 0u32;
        for _ in 0..SIZE_RETRIES {
            match Self::open(name) {
                Ok(buf) => return Ok(buf),
                Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Self::create_with(name, opts);
                }
                // Creator is between sizing the segment and writing the header.
                Err(TransportError::NotReady { .. }) => adaptive_yield(&mut k),
                Err(e) => return Err(e),
            }
        }
        Err(TransportError::NotReady { name: name.to_owned() })
    }

    fn from_parts(name: &str, shm: ShmHandle, lock: IpcMutex) -> Result<Self> {
        let hdr = shm.header::<CyclicHeader>()?;
        if hdr.magic.load(Ordering::Acquire) != MAGIC {
            return Err(TransportError::NotReady { name: name.to_owned() });
        }
        let capacity = hdr.capacity.load(Ordering::Relaxed) as usize;
        let min_body = hdr.min_body.load(Ordering::Relaxed) as usize;
        let overwrite_on_full = hdr.overwrite.load(Ordering::Relaxed) != 0;
        if HEADER_SIZE + capacity > shm.user_size() {
            return Err(TransportError::malformed(
                "buffer header",
                format!("capacity {capacity} exceeds mapped size {}", shm.user_size()),
            ));
        }
        Ok(Self {
            name: name.to_owned(),
            shm,
            lock,
            capacity,
            overwrite_on_full,
            min_body,
            policy: Box::new(WholeRecordEviction::new(min_body)),
            listener: None,
        })
    }

    /// Replace the eviction strategy used by this handle.
    pub fn with_policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Install the listener notified after each successful write.
    pub fn set_data_listener(&mut self, listener: Arc<dyn DataListener>) {
        self.listener = Some(listener);
    }

    /// Lock the buffer within `timeout`.
    ///
    /// With `wait_for_data`, additionally wait (within the same timeout) until
    /// at least one byte is occupied. `Ok(None)` means the timeout elapsed;
    /// the lock is released when the returned guard drops.
    pub fn lock(&self, wait_for_data: bool, timeout: Duration) -> Result<Option<BufferGuard<'_>>> {
        let hdr = self.header()?;
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.lock.lock_timeout(remaining)? {
                return Ok(None);
            }
            let guard = BufferGuard::new(self, hdr);
            if !wait_for_data || guard.used() > 0 {
                return Ok(Some(guard));
            }
            drop(guard);
            if Instant::now() >= deadline {
                return Ok(None);
            }
            adaptive_yield(&mut k);
        }
    }

    /// Snapshot of the shared counters.
    pub fn stats(&self) -> Result<BufferStats> {
        let hdr = self.header()?;
        let used = hdr
            .write
            .load(Ordering::Acquire)
            .wrapping_sub(hdr.read.load(Ordering::Acquire)) as usize;
        Ok(BufferStats {
            records_written: hdr.records_written.load(Ordering::Relaxed),
            records_rejected: hdr.records_rejected.load(Ordering::Relaxed),
            bytes_evicted: hdr.bytes_evicted.load(Ordering::Relaxed),
            corrupt_flushes: hdr.corrupt_flushes.load(Ordering::Relaxed),
            used: used.min(self.capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overwrite_on_full(&self) -> bool {
        self.overwrite_on_full
    }

    pub fn min_body(&self) -> usize {
        self.min_body
    }

    /// Largest record body this buffer can ever hold.
    pub fn max_body(&self) -> usize {
        (self.capacity - LEN_PREFIX).min(MAX_BODY)
    }

    /// Release this handle. The segment disappears once no process maps it.
    pub fn close(self) {}

    /// Remove the named objects backing a buffer.
    pub fn clear_storage(name: &str) {
        ShmHandle::unlink_by_name(name);
        IpcMutex::clear_storage(&lock_name(name));
    }

    fn header(&self) -> Result<&CyclicHeader> {
        Ok(self.shm.header::<CyclicHeader>()?)
    }

    pub(crate) fn shm(&self) -> &ShmHandle {
        &self.shm
    }

    pub(crate) fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    pub(crate) fn listener(&self) -> Option<&Arc<dyn DataListener>> {
        self.listener.as_ref()
    }

    pub(crate) fn raw_lock(&self) -> &IpcMutex {
        &self.lock
    }
}

impl std::fmt::Debug for CyclicBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("overwrite_on_full", &self.overwrite_on_full)
            .finish()
    }
}

fn lock_name(name: &str) -> String {
    format!("{name}.lock")
}

/// Map a segment, riding out the short window in which a peer has created
/// the object but not yet sized it.
fn map_with_retry(name: &str, size: usize, mode: ShmOpenMode) -> Result<ShmHandle> {
    let mut k = 0u32;
    let mut attempt = 0u32;
    loop {
        match ShmHandle::acquire(name, size, mode) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && attempt < SIZE_RETRIES => {
                attempt += 1;
                adaptive_yield(&mut k);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(TransportError::NotReady { name: name.to_owned() });
            }
            other => return Ok(other?),
        }
    }
}
