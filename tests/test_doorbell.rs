// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Doorbell ring / wait / acknowledge / relinquish semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use diagring::{Doorbell, WaitStatus};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_bell_{}_{n}", std::process::id())
}

#[test]
fn wait_times_out_without_ring() {
    let bell = Doorbell::open(&unique_name("timeout")).unwrap();
    let start = Instant::now();
    assert_eq!(bell.wait(Some(Duration::from_millis(30))).unwrap(), WaitStatus::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn ring_before_wait_is_not_lost() {
    let bell = Doorbell::open(&unique_name("early")).unwrap();
    bell.ring().unwrap();
    assert!(bell.is_pending());
    assert_eq!(bell.wait(Some(Duration::from_millis(10))).unwrap(), WaitStatus::Signaled);
}

#[test]
fn unacknowledged_signal_keeps_waits_returning() {
    let bell = Doorbell::open(&unique_name("ack")).unwrap();
    bell.ring().unwrap();
    assert_eq!(bell.wait(Some(Duration::ZERO)).unwrap(), WaitStatus::Signaled);
    assert_eq!(bell.wait(Some(Duration::ZERO)).unwrap(), WaitStatus::Signaled);

    bell.acknowledge().unwrap();
    assert!(!bell.is_pending());
    assert_eq!(bell.wait(Some(Duration::from_millis(10))).unwrap(), WaitStatus::TimedOut);
}

#[test]
fn rings_coalesce_into_one_wake() {
    let bell = Doorbell::open(&unique_name("coalesce")).unwrap();
    for _ in 0..5 {
        bell.ring().unwrap();
    }
    assert_eq!(bell.ring_count(), 5);
    assert_eq!(bell.wait(None).unwrap(), WaitStatus::Signaled);
    bell.acknowledge().unwrap();
    assert_eq!(bell.wait(Some(Duration::from_millis(10))).unwrap(), WaitStatus::TimedOut);
}

#[test]
fn ring_from_another_handle_wakes_a_blocked_waiter() {
    let name = unique_name("cross");
    let waiter_bell = Arc::new(Doorbell::open(&name).unwrap());
    let ringer = Doorbell::open(&name).unwrap();

    let b = waiter_bell.clone();
    let waiter = thread::spawn(move || b.wait(Some(Duration::from_secs(5))).unwrap());

    thread::sleep(Duration::from_millis(30));
    ringer.ring().unwrap();
    assert_eq!(waiter.join().unwrap(), WaitStatus::Signaled);
}

#[test]
fn relinquish_unblocks_only_that_handle() {
    let name = unique_name("relinquish");
    let mine = Arc::new(Doorbell::open(&name).unwrap());
    let theirs = Doorbell::open(&name).unwrap();

    let b = mine.clone();
    let waiter = thread::spawn(move || b.wait(None).unwrap());
    thread::sleep(Duration::from_millis(30));

    mine.relinquish().unwrap();
    assert_eq!(waiter.join().unwrap(), WaitStatus::Relinquished);
    assert_eq!(mine.wait(Some(Duration::from_secs(1))).unwrap(), WaitStatus::Relinquished);

    assert!(!theirs.is_relinquished());
    assert_eq!(theirs.wait(Some(Duration::from_millis(10))).unwrap(), WaitStatus::TimedOut);
    theirs.ring().unwrap();
    assert_eq!(theirs.wait(Some(Duration::from_millis(10))).unwrap(), WaitStatus::Signaled);
}
