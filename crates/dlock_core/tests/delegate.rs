//! Contended behaviour of the delegate lock on OS threads.

#![cfg(not(loom))]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dlock_core::word::WordState;
use dlock_core::{RawThreadLock, ThreadCpus, ThreadLock};
use rand::Rng;

fn spin_for(iters: u32) {
    for _ in 0..iters {
        std::hint::spin_loop();
    }
}

#[test]
fn four_cores_increment_shared_counter() {
    let counter = Arc::new(ThreadLock::new(0u64));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let counter = counter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..1000 {
                    counter.run(|c| *c += 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.run(|c| *c), 4000);
    assert!(!counter.is_locked());
}

#[test]
fn try_lock_twice_fails_the_second_time() {
    let lock = RawThreadLock::new();
    assert!(lock.try_lock());
    assert!(!lock.try_lock());
    assert!(lock.is_locked());
    unsafe { lock.unlock() };
    assert_eq!(lock.state(), WordState::Free);
}

#[test]
fn uncontended_lock_unlock_leaves_word_free() {
    let lock = RawThreadLock::new();
    lock.lock();
    assert_eq!(lock.state(), WordState::Held);
    unsafe { lock.unlock() };
    assert_eq!(lock.state(), WordState::Free);
}

#[test]
fn holder_runs_waiting_request_on_unlock() {
    let lock = Arc::new(RawThreadLock::new());
    let invoked = Arc::new(AtomicBool::new(false));

    lock.lock();
    let holder = ThreadCpus::id().unwrap();

    let waiter = {
        let lock = lock.clone();
        let invoked = invoked.clone();
        thread::spawn(move || {
            let me = ThreadCpus::id().unwrap();
            let ran_on = lock.run_delegated(move || {
                invoked.store(true, Ordering::Relaxed);
                ThreadCpus::id().unwrap()
            });
            (me, ran_on)
        })
    };

    while !matches!(lock.state(), WordState::HeldWithWaiter(_)) {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!invoked.load(Ordering::Relaxed));

    unsafe { lock.unlock() };
    let (waiter_cpu, ran_on) = waiter.join().unwrap();

    assert!(invoked.load(Ordering::Relaxed));
    assert_ne!(waiter_cpu, holder);
    assert_eq!(ran_on, holder);
    assert_eq!(lock.state(), WordState::Free);
}

#[test]
fn critical_sections_never_overlap() {
    const THREADS: usize = 8;
    const ITERS: usize = 2000;

    let lock = Arc::new(RawThreadLock::new());
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let lock = lock.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            let total = total.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                barrier.wait();
                for i in 0..ITERS {
                    let work = rng.gen_range(0..64);
                    let section = {
                        let inside = inside.clone();
                        let overlaps = overlaps.clone();
                        let total = total.clone();
                        move || {
                            if inside.swap(true, Ordering::Relaxed) {
                                overlaps.fetch_add(1, Ordering::Relaxed);
                            }
                            // Non-atomic style read-modify-write under the lock.
                            let seen = total.load(Ordering::Relaxed);
                            spin_for(work);
                            total.store(seen + 1, Ordering::Relaxed);
                            inside.store(false, Ordering::Relaxed);
                        }
                    };
                    if (t + i) % 3 == 0 {
                        lock.lock();
                        section();
                        unsafe { lock.unlock() };
                    } else {
                        lock.run_delegated(section);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::Relaxed), 0);
    assert_eq!(total.load(Ordering::Relaxed), THREADS * ITERS);
    assert!(!lock.is_locked());
}

#[test]
fn every_request_runs_exactly_once_and_returns_its_own_result() {
    const THREADS: usize = 6;
    const ITERS: usize = 1500;

    let lock = Arc::new(RawThreadLock::new());
    let hits: Arc<Vec<AtomicU32>> =
        Arc::new((0..THREADS * ITERS).map(|_| AtomicU32::new(0)).collect());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let lock = lock.clone();
            let hits = hits.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ITERS {
                    let slot = t * ITERS + i;
                    let hits = hits.clone();
                    let got = lock.run_delegated(move || {
                        hits[slot].fetch_add(1, Ordering::Relaxed);
                        slot * 2 + 1
                    });
                    assert_eq!(got, slot * 2 + 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
}

#[test]
fn many_rounds_of_short_bursts_complete() {
    const THREADS: usize = 5;
    const ROUNDS: usize = 50;
    const BURST: usize = 40;

    let counter = Arc::new(ThreadLock::new(Vec::<usize>::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let counter = counter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    barrier.wait();
                    for _ in 0..BURST {
                        counter.run(move |v| v.push(t));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let pushed = counter.run(|v| v.clone());
    assert_eq!(pushed.len(), THREADS * ROUNDS * BURST);
    for t in 0..THREADS {
        assert_eq!(pushed.iter().filter(|&&x| x == t).count(), ROUNDS * BURST);
    }
}
