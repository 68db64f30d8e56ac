// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII access to a locked cyclic buffer. The named mutex is held for the
// guard's lifetime and released on drop.

use std::sync::atomic::Ordering;

use super::{CyclicBuffer, CyclicHeader, RingView, HEADER_SIZE};
use crate::codec::LEN_PREFIX;
use crate::error::Result;

/// Why a record was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The record is larger than the whole buffer.
    TooLarge,
    /// Overwrite is disabled and not enough space is free.
    NoSpace,
}

/// Result of [`BufferGuard::write_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored; `evicted` bytes of older records were dropped to make room.
    Written { evicted: usize },
    /// Not stored.
    Dropped(DropReason),
}

/// Result of [`BufferGuard::pop_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// A record body of this many bytes was copied to the front of the scratch.
    Record(usize),
    /// Nothing to read.
    Empty,
    /// The next length prefix was implausible; the whole unread tail
    /// (`flushed` bytes) was discarded.
    Corrupt { flushed: usize },
}

/// Exclusive access to a [`CyclicBuffer`] for one writer or administrator.
pub struct BufferGuard<'a> {
    buf: &'a CyclicBuffer,
    hdr: &'a CyclicHeader,
    reserved: usize,
}

impl<'a> BufferGuard<'a> {
    pub(super) fn new(buf: &'a CyclicBuffer, hdr: &'a CyclicHeader) -> Self {
        Self { buf, hdr, reserved: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity
    }

    /// Bytes occupied by unread records.
    pub fn used(&self) -> usize {
        let w = self.hdr.write.load(Ordering::Acquire);
        let r = self.hdr.read.load(Ordering::Acquire);
        (w.wrapping_sub(r) as usize).min(self.buf.capacity)
    }

    pub fn free(&self) -> usize {
        self.buf.capacity - self.used()
    }

    /// Reserve room for `n` bytes and return how many were granted.
    ///
    /// Returns 0 when `n` exceeds the capacity. When space is short and
    /// overwrite is on, the eviction policy frees whole old records first;
    /// with overwrite off the grant is whatever is free. The grant replaces
    /// any earlier, unused reservation.
    pub fn reserve(&mut self, n: usize) -> usize {
        self.reserved = 0;
        if n > self.buf.capacity {
            return 0;
        }
        let free = self.free();
        if n <= free {
            self.reserved = n;
            return n;
        }
        if self.buf.overwrite_on_full {
            let occupied = self.used();
            let drop = self.buf.policy().overwrite_size(&*self, n - free).min(occupied);
            if drop > 0 {
                self.hdr.read.fetch_add(drop as u64, Ordering::AcqRel);
                self.hdr.bytes_evicted.fetch_add(drop as u64, Ordering::Relaxed);
                tracing::trace!(buffer = %self.buf.name, bytes = drop, "evicted old records");
            }
        }
        self.reserved = n.min(self.free());
        self.reserved
    }

    /// Append `bytes` into the reserved region, wrapping at the end of the
    /// buffer. Anything beyond the reservation is not written. Notifies the
    /// data listener once if anything was written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let n = bytes.len().min(self.reserved);
        if n == 0 {
            return Ok(0);
        }
        let w = self.hdr.write.load(Ordering::Acquire);
        self.copy_in(w, &bytes[..n])?;
        self.hdr.write.store(w.wrapping_add(n as u64), Ordering::Release);
        self.reserved -= n;
        if let Some(listener) = self.buf.listener() {
            listener.data_available();
        }
        Ok(n)
    }

    /// Store one complete framed record (`[u16 len][body]`), or drop it whole.
    pub fn write_record(&mut self, record: &[u8]) -> Result<WriteOutcome> {
        let before = self.hdr.bytes_evicted.load(Ordering::Relaxed);
        let granted = self.reserve(record.len());
        if granted < record.len() {
            self.reserved = 0;
            self.hdr.records_rejected.fetch_add(1, Ordering::Relaxed);
            let reason = if record.len() > self.buf.capacity {
                DropReason::TooLarge
            } else {
                DropReason::NoSpace
            };
            return Ok(WriteOutcome::Dropped(reason));
        }
        self.write(record)?;
        self.hdr.records_written.fetch_add(1, Ordering::Relaxed);
        let evicted = self.hdr.bytes_evicted.load(Ordering::Relaxed).wrapping_sub(before);
        Ok(WriteOutcome::Written {
            evicted: evicted as usize,
        })
    }

    /// Frame `body` with its length prefix and store it.
    pub fn write_body(&mut self, body: &[u8]) -> Result<WriteOutcome> {
        if body.len() > self.buf.max_body() {
            self.hdr.records_rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(WriteOutcome::Dropped(DropReason::TooLarge));
        }
        let mut record = Vec::with_capacity(LEN_PREFIX + body.len());
        record.extend_from_slice(&(body.len() as u16).to_le_bytes());
        record.extend_from_slice(body);
        self.write_record(&record)
    }

    /// Remove the oldest record and copy its body into `scratch`.
    ///
    /// A length prefix below the buffer's minimum body, above
    /// `scratch.len()`, or beyond the occupied bytes means the stream is out
    /// of sync: the entire unread tail is discarded rather than repaired.
    pub fn pop_record(&mut self, scratch: &mut [u8]) -> Result<PopOutcome> {
        let used = self.used();
        if used == 0 {
            return Ok(PopOutcome::Empty);
        }
        let body = self.record_len_at(0);
        let plausible = matches!(body, Some(len)
            if len >= self.buf.min_body && len <= scratch.len() && LEN_PREFIX + len <= used);
        let len = match body {
            Some(len) if plausible => len,
            _ => {
                let flushed = self.discard_all();
                self.hdr.corrupt_flushes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    buffer = %self.buf.name,
                    announced = ?body,
                    flushed,
                    "implausible record length, flushed unread tail"
                );
                return Ok(PopOutcome::Corrupt { flushed });
            }
        };
        let r = self.hdr.read.load(Ordering::Acquire);
        self.copy_out(r.wrapping_add(LEN_PREFIX as u64), &mut scratch[..len])?;
        self.hdr.read.store(r.wrapping_add((LEN_PREFIX + len) as u64), Ordering::Release);
        Ok(PopOutcome::Record(len))
    }

    /// Drop every unread byte. Returns how many were dropped.
    pub fn discard_all(&mut self) -> usize {
        let used = self.used();
        let w = self.hdr.write.load(Ordering::Acquire);
        self.hdr.read.store(w, Ordering::Release);
        used
    }

    fn data_offset(&self, pos: u64) -> usize {
        (pos % self.buf.capacity as u64) as usize
    }

    fn copy_in(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        let off = self.data_offset(pos);
        let first = bytes.len().min(self.buf.capacity - off);
        let shm = self.buf.shm();
        shm.write_at(HEADER_SIZE + off, &bytes[..first])?;
        if first < bytes.len() {
            shm.write_at(HEADER_SIZE, &bytes[first..])?;
        }
        Ok(())
    }

    fn copy_out(&self, pos: u64, out: &mut [u8]) -> Result<()> {
        let off = self.data_offset(pos);
        let first = out.len().min(self.buf.capacity - off);
        let shm = self.buf.shm();
        let (head, tail) = out.split_at_mut(first);
        shm.read_at(HEADER_SIZE + off, head)?;
        if !tail.is_empty() {
            shm.read_at(HEADER_SIZE, tail)?;
        }
        Ok(())
    }
}

impl RingView for BufferGuard<'_> {
    fn occupied(&self) -> usize {
        self.used()
    }

    fn peek(&self, rel: usize, out: &mut [u8]) -> bool {
        if rel + out.len() > self.used() {
            return false;
        }
        let r = self.hdr.read.load(Ordering::Acquire);
        self.copy_out(r.wrapping_add(rel as u64), out).is_ok()
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.buf.raw_lock().unlock() {
            tracing::warn!(buffer = %self.buf.name, error = %e, "failed to unlock buffer");
        }
    }
}
