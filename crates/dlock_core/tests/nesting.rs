//! Node pool nesting, combiner budget and the `lock_api` surface.

#![cfg(not(loom))]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dlock_common::{MAX_CPUS, MAX_NODES};
use dlock_core::pool::{self, NodeState};
use dlock_core::word::WordState;
use dlock_core::{
    DelegateMutex, LockError, RawDelegateLock, RawThreadLock, ThreadCpus, ThreadLock, Topology,
};

fn addr(lock: &RawThreadLock) -> usize {
    lock as *const RawThreadLock as usize
}

#[test]
fn nested_request_leaves_outer_node_untouched() {
    let outer = RawThreadLock::new();
    let inner = RawThreadLock::new();
    let cpu = ThreadCpus::id().unwrap();

    outer.lock();
    let before = pool::snapshot(cpu).unwrap();
    assert_eq!(before.depth, 1);
    assert_eq!(before.slots[0].lock, addr(&outer));
    assert_eq!(before.slots[0].state, NodeState::Idle);

    let seen = inner.run_delegated(move || pool::snapshot(cpu).unwrap());
    assert_eq!(seen.depth, 2);
    assert_eq!(seen.slots[1].lock, addr(&inner));

    let after = pool::snapshot(cpu).unwrap();
    assert_eq!(after.depth, 1);
    assert_eq!(after.slots[0], before.slots[0]);
    assert!(outer.is_locked());
    assert!(!inner.is_locked());

    unsafe { outer.unlock() };
    assert_eq!(pool::snapshot(cpu).unwrap().depth, 0);
}

#[test]
fn fifth_nested_claim_is_refused() {
    let locks: Vec<RawThreadLock> = (0..MAX_NODES + 1).map(|_| RawThreadLock::new()).collect();

    for lock in &locks[..MAX_NODES] {
        lock.lock();
    }
    let err = locks[MAX_NODES].try_run_delegated(|| ()).unwrap_err();
    assert_eq!(err, LockError::NestingOverflow);
    assert!(!locks[MAX_NODES].is_locked());

    for lock in locks[..MAX_NODES].iter().rev() {
        unsafe { lock.unlock() };
    }
    assert_eq!(locks[MAX_NODES].try_run_delegated(|| 7), Ok(7));
}

#[test]
fn fifth_nested_lock_panics() {
    let result = thread::spawn(|| {
        let locks: Vec<RawThreadLock> =
            (0..MAX_NODES + 1).map(|_| RawThreadLock::new()).collect();
        for lock in &locks {
            lock.lock();
        }
    })
    .join();
    assert!(result.is_err());
}

#[test]
fn unlock_without_holding_is_fatal() {
    let result = thread::spawn(|| {
        let lock = RawThreadLock::new();
        unsafe { lock.unlock() };
    })
    .join();
    assert!(result.is_err());
}

#[test]
fn zero_budget_promotes_the_waiter_instead_of_serving_it() {
    let lock = Arc::new(RawThreadLock::with_budget(0));
    lock.lock();
    let holder = ThreadCpus::id().unwrap();

    let waiter = {
        let lock = lock.clone();
        thread::spawn(move || {
            let me = ThreadCpus::id().unwrap();
            let ran_on = lock.run_delegated(|| ThreadCpus::id().unwrap());
            (me, ran_on)
        })
    };

    while !matches!(lock.state(), WordState::HeldWithWaiter(_)) {
        thread::sleep(Duration::from_millis(1));
    }
    unsafe { lock.unlock() };

    let (me, ran_on) = waiter.join().unwrap();
    assert_ne!(me, holder);
    assert_eq!(ran_on, me);
    assert_eq!(lock.state(), WordState::Free);
}

#[test]
fn plain_waiter_becomes_holder_after_unlock() {
    let lock = Arc::new(RawThreadLock::new());
    let acquired = Arc::new(AtomicBool::new(false));
    lock.lock();

    let waiter = {
        let lock = lock.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            lock.lock();
            acquired.store(true, Ordering::Relaxed);
            unsafe { lock.unlock() };
        })
    };

    while !matches!(lock.state(), WordState::HeldWithWaiter(_)) {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!acquired.load(Ordering::Relaxed));
    unsafe { lock.unlock() };

    waiter.join().unwrap();
    assert!(acquired.load(Ordering::Relaxed));
    assert_eq!(lock.state(), WordState::Free);
}

#[test]
fn small_budget_under_contention_still_completes() {
    const THREADS: usize = 6;
    const ITERS: u64 = 3000;

    let counter = Arc::new(ThreadLock::with_budget(0u64, 2));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ITERS {
                    counter.run(|c| *c += 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.run(|c| *c), THREADS as u64 * ITERS);
}

#[test]
fn guard_and_delegated_calls_mix() {
    const THREADS: usize = 4;
    const ITERS: u64 = 2000;

    let counter = Arc::new(ThreadLock::new(0u64));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let counter = counter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ITERS {
                    if (t as u64 + i) % 2 == 0 {
                        *counter.lock() += 1;
                    } else {
                        counter.run(|c| *c += 1);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), THREADS as u64 * ITERS);
    assert!(counter.try_lock().is_some());
}

#[test]
fn lock_api_mutex_counts_correctly() {
    static COUNTER: DelegateMutex<u64> = DelegateMutex::new(0);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                for _ in 0..2500 {
                    *COUNTER.lock() += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*COUNTER.lock(), 10_000);
    assert!(!COUNTER.is_locked());
}

/// Reports an identity above its own online bound.
struct OutsideOnline;

impl Topology for OutsideOnline {
    fn current() -> Result<usize, LockError> {
        Ok(MAX_CPUS - 1)
    }

    fn online() -> usize {
        1
    }
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "outside the online range")]
fn combiner_rejects_identity_beyond_online() {
    let lock = RawDelegateLock::<OutsideOnline>::new();
    lock.lock();
    unsafe { lock.unlock() };
}

#[cfg(unix)]
#[test]
fn panicking_callback_aborts_the_process() {
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    const NAME: &str = "panicking_callback_aborts_the_process";
    const SIGABRT: i32 = 6;

    if std::env::var_os("DLOCK_ABORT_CHILD").is_some() {
        let lock = RawThreadLock::new();
        lock.run_delegated(|| -> u32 { panic!("callback failed") });
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([NAME, "--exact", "--test-threads=1", "--nocapture"])
        .env("DLOCK_ABORT_CHILD", "1")
        .output()
        .unwrap();
    assert_eq!(output.status.signal(), Some(SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("delegated callback unwound while holding the lock"));
}
