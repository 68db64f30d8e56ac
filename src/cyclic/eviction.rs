// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Eviction strategy for full buffers.
//
// The buffer asks its policy how many bytes to drop from the oldest end only
// when a reservation does not fit. Policies see the occupied region through
// `RingView`, so they can be exercised on plain memory.

use std::fmt;

use crate::codec::{read_len_prefix, LEN_PREFIX};

/// Read-only view of the occupied region of a ring, indexed from the read
/// cursor (offset 0 is the first byte of the oldest record).
pub trait RingView {
    /// Bytes currently occupied by complete records.
    fn occupied(&self) -> usize;

    /// Copy `out.len()` bytes starting `rel` bytes past the read cursor,
    /// following wraparound. Returns `false` if the range is not occupied.
    fn peek(&self, rel: usize, out: &mut [u8]) -> bool;

    /// Body length announced by the prefix at `rel`, if one is readable.
    fn record_len_at(&self, rel: usize) -> Option<usize> {
        let mut prefix = [0u8; LEN_PREFIX];
        self.peek(rel, &mut prefix).then(|| read_len_prefix(prefix))
    }
}

/// Decides how many bytes to discard from the oldest end of a full ring.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Bytes to drop so that at least `needed` more bytes become free.
    /// The answer is clamped to `view.occupied()` by the caller.
    fn overwrite_size(&self, view: &dyn RingView, needed: usize) -> usize;
}

/// Drops whole records, oldest first, until enough space is freed.
///
/// The walk follows each record's length prefix and always stops on a record
/// boundary. A prefix that cannot describe a record (shorter than
/// `min_body`, or running past the occupied region) means the region is
/// desynchronised; everything is dropped.
#[derive(Debug, Clone, Copy)]
pub struct WholeRecordEviction {
    min_body: usize,
}

impl WholeRecordEviction {
    pub const fn new(min_body: usize) -> Self {
        Self { min_body }
    }
}

impl EvictionPolicy for WholeRecordEviction {
    fn overwrite_size(&self, view: &dyn RingView, needed: usize) -> usize {
        let occupied = view.occupied();
        let mut dropped = 0usize;
        while dropped < needed && dropped < occupied {
            let record = match view.record_len_at(dropped) {
                Some(body) if body >= self.min_body => LEN_PREFIX + body,
                _ => return occupied,
            };
            if dropped + record > occupied {
                return occupied;
            }
            dropped += record;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ring over a Vec with an arbitrary start, for driving policies directly.
    struct VecRing {
        data: Vec<u8>,
        read: usize,
        used: usize,
    }

    impl VecRing {
        fn with_records(capacity: usize, start: usize, bodies: &[usize]) -> Self {
            let mut ring = Self {
                data: vec![0; capacity],
                read: start,
                used: 0,
            };
            for (i, &body) in bodies.iter().enumerate() {
                let mut rec = (body as u16).to_le_bytes().to_vec();
                rec.extend(std::iter::repeat(i as u8).take(body));
                for b in rec {
                    let at = (ring.read + ring.used) % capacity;
                    ring.data[at] = b;
                    ring.used += 1;
                }
            }
            ring
        }
    }

    impl RingView for VecRing {
        fn occupied(&self) -> usize {
            self.used
        }

        fn peek(&self, rel: usize, out: &mut [u8]) -> bool {
            if rel + out.len() > self.used {
                return false;
            }
            for (i, b) in out.iter_mut().enumerate() {
                *b = self.data[(self.read + rel + i) % self.data.len()];
            }
            true
        }
    }

    #[test]
    fn drops_just_enough_whole_records() {
        let ring = VecRing::with_records(256, 0, &[30, 30, 30]);
        let policy = WholeRecordEviction::new(4);
        assert_eq!(policy.overwrite_size(&ring, 1), 32);
        assert_eq!(policy.overwrite_size(&ring, 32), 32);
        assert_eq!(policy.overwrite_size(&ring, 33), 64);
        assert_eq!(policy.overwrite_size(&ring, 500), 96);
    }

    #[test]
    fn follows_prefixes_across_wraparound() {
        // Start near the end so the second prefix straddles the wrap point.
        let ring = VecRing::with_records(64, 50, &[11, 20, 5]);
        let policy = WholeRecordEviction::new(1);
        assert_eq!(policy.overwrite_size(&ring, 14), 13 + 22);
        assert_eq!(policy.overwrite_size(&ring, 36), 13 + 22 + 7);
    }

    #[test]
    fn nothing_needed_drops_nothing() {
        let ring = VecRing::with_records(64, 0, &[8]);
        assert_eq!(WholeRecordEviction::new(1).overwrite_size(&ring, 0), 0);
    }

    #[test]
    fn implausible_prefix_drops_everything() {
        let mut ring = VecRing::with_records(64, 0, &[10, 10]);
        // Corrupt the second prefix to claim a huge body.
        ring.data[12] = 0xff;
        ring.data[13] = 0xff;
        let policy = WholeRecordEviction::new(4);
        assert_eq!(policy.overwrite_size(&ring, 13), ring.occupied());

        // A body shorter than the minimum is just as suspicious.
        let ring = VecRing::with_records(64, 0, &[2, 10]);
        assert_eq!(policy.overwrite_size(&ring, 1), ring.occupied());
    }
}
