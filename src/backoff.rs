// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive backoff used by every polling loop in the crate.

/// One backoff step: busy spin, then CPU pause hints, then yields, then 1 ms
/// sleeps once `k` passes 32.
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

#[cfg(test)]
mod tests {
    use super::adaptive_yield;

    #[test]
    fn counter_saturates_at_sleep_phase() {
        let mut k = 0u32;
        for _ in 0..40 {
            adaptive_yield(&mut k);
        }
        assert_eq!(k, 32);
    }
}
