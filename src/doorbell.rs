// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named cross-process wake signal.
//
// A doorbell is three named objects: a tiny shared segment holding the
// pending flag, a process-shared condition variable (`<name>.cond`) and the
// mutex guarding it (`<name>.mutex`). Ringing sets the flag and broadcasts;
// waiting sleeps until the flag is set. The flag stays set until a waiter
// acknowledges it, so a ring that happens while nobody waits is not lost.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::cyclic::DataListener;
use crate::shm::{ShmHandle, ShmLayout, ShmOpenMode};
use crate::{IpcCondition, IpcMutex};

#[repr(C)]
struct BellState {
    pending: AtomicU32,
    rings: AtomicU32,
}

// Safety: repr(C), atomics only, all-zero is "not pending".
unsafe impl ShmLayout for BellState {}

/// Outcome of [`Doorbell::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The bell was rung. Call [`Doorbell::acknowledge`] before waiting again.
    Signaled,
    TimedOut,
    /// This handle was relinquished; it will not wait again.
    Relinquished,
}

pub struct Doorbell {
    name: String,
    state: ShmHandle,
    cond: IpcCondition,
    lock: IpcMutex,
    relinquished: AtomicBool,
}

impl Doorbell {
    /// Open (or create) the doorbell called `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        let state = ShmHandle::acquire(name, std::mem::size_of::<BellState>(), ShmOpenMode::CreateOrOpen)?;
        state.header::<BellState>()?;
        let cond = IpcCondition::open(&format!("{name}.cond"))?;
        let lock = IpcMutex::open(&format!("{name}.mutex"))?;
        Ok(Self {
            name: name.to_owned(),
            state,
            cond,
            lock,
            relinquished: AtomicBool::new(false),
        })
    }

    fn bell(&self) -> io::Result<&BellState> {
        self.state.header::<BellState>()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake every waiter. Rings that arrive before the pending flag is
    /// acknowledged coalesce into one wake.
    pub fn ring(&self) -> io::Result<()> {
        let bell = self.bell()?;
        bell.pending.store(1, Ordering::Release);
        bell.rings.fetch_add(1, Ordering::Relaxed);
        // Barrier: a waiter that saw pending == 0 is inside cond_wait before we broadcast.
        self.lock.lock()?;
        self.lock.unlock()?;
        self.cond.broadcast()
    }

    /// Block until the bell is rung, `timeout` elapses (`None` waits
    /// forever) or this handle is relinquished.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<WaitStatus> {
        let bell = self.bell()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        self.lock.lock()?;
        let status = self.wait_locked(bell, deadline);
        self.lock.unlock()?;
        status
    }

    fn wait_locked(&self, bell: &BellState, deadline: Option<Instant>) -> io::Result<WaitStatus> {
        loop {
            if self.relinquished.load(Ordering::Acquire) {
                return Ok(WaitStatus::Relinquished);
            }
            if bell.pending.load(Ordering::Acquire) != 0 {
                return Ok(WaitStatus::Signaled);
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(WaitStatus::TimedOut);
                    }
                    Some(left)
                }
            };
            // false is a timeout; the loop re-checks the flags and the deadline.
            self.cond.wait(&self.lock, remaining)?;
        }
    }

    /// Consume the pending signal.
    pub fn acknowledge(&self) -> io::Result<()> {
        self.bell()?.pending.store(0, Ordering::Release);
        Ok(())
    }

    /// Whether a ring has not been acknowledged yet.
    pub fn is_pending(&self) -> bool {
        self.bell()
            .map(|b| b.pending.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    /// Total rings seen on this bell by any process.
    pub fn ring_count(&self) -> u32 {
        self.bell().map(|b| b.rings.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Give up this handle's interest: current and future waits on it return
    /// [`WaitStatus::Relinquished`]. Other handles to the same bell, and the
    /// buffer it belongs to, are unaffected.
    pub fn relinquish(&self) -> io::Result<()> {
        self.relinquished.store(true, Ordering::Release);
        self.lock.lock()?;
        self.lock.unlock()?;
        self.cond.broadcast()
    }

    pub fn is_relinquished(&self) -> bool {
        self.relinquished.load(Ordering::Acquire)
    }

    /// Remove the named objects backing a doorbell.
    pub fn clear_storage(name: &str) {
        ShmHandle::unlink_by_name(name);
        IpcCondition::clear_storage(&format!("{name}.cond"));
        IpcMutex::clear_storage(&format!("{name}.mutex"));
    }
}

impl DataListener for Doorbell {
    fn data_available(&self) {
        if let Err(e) = self.ring() {
            tracing::warn!(doorbell = %self.name, error = %e, "failed to ring doorbell");
        }
    }
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doorbell")
            .field("name", &self.name)
            .field("relinquished", &self.is_relinquished())
            .finish()
    }
}
