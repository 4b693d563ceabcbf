use rand::prelude::*;
use rand_pcg::Pcg32;
use segsem::{PruningSemaphore, Semaphore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use test_log::test;

fn new_rng() -> impl Rng {
    Pcg32::from_seed(0xcafef00dd15ea5e5cafef00dd15ea5e5u128.to_le_bytes())
}

/// Wait until `n` acquirers have reserved queue slots, then give their
/// installs a moment to land.
fn wait_for_waiters(waiting_count: impl Fn() -> usize, n: usize) {
    while waiting_count() < n {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(20));
}

#[test]
fn fifo_handoff_across_threads() {
    let semaphore = Arc::new(Semaphore::new(1));
    semaphore.acquire(None).unwrap();
    assert_eq!(semaphore.available_permits(), 0);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for id in 0..3usize {
        let semaphore_clone = Arc::clone(&semaphore);
        let order = Arc::clone(&order);
        waiters.push(thread::spawn(move || {
            semaphore_clone.acquire(None).unwrap();
            order.lock().unwrap().push(id);
        }));
        // enqueue strictly one at a time
        wait_for_waiters(|| semaphore.waiting_count(), id + 1);
    }

    for resumed in 1..=3 {
        semaphore.release();
        while order.lock().unwrap().len() < resumed {
            thread::yield_now();
        }
        assert_eq!(*order.lock().unwrap(), (0..resumed).collect::<Vec<_>>());
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(semaphore.available_permits(), 0);
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn reentry_after_drain() {
    let semaphore = Arc::new(Semaphore::new(2));
    semaphore.acquire(None).unwrap();
    semaphore.acquire(None).unwrap();
    assert_eq!(semaphore.available_permits(), 0);

    let waiter = {
        let semaphore = Arc::clone(&semaphore);
        thread::spawn(move || {
            semaphore.acquire(None).unwrap();
            semaphore.release();
        })
    };
    wait_for_waiters(|| semaphore.waiting_count(), 1);

    semaphore.release();
    waiter.join().unwrap();
    semaphore.release();
    assert_eq!(semaphore.available_permits(), 2);
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn immediate_acquire_is_exactly_once() {
    let semaphore = Semaphore::new(1);
    let successes = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..1024 {
            scope.spawn(|| {
                if semaphore.try_acquire_now() {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(semaphore.available_permits(), 0);
}

#[test]
fn immediate_acquire_never_joins_the_queue() {
    let semaphore = Semaphore::new(0);
    assert!(!semaphore.try_acquire_now());
    assert_eq!(semaphore.waiting_count(), 0);
    semaphore.release();
    assert!(semaphore.try_acquire_now());
}

#[test]
fn over_release_raises_the_count() {
    let semaphore = Semaphore::new(0);
    semaphore.release_n(3);
    assert_eq!(semaphore.available_permits(), 3);
    semaphore.acquire(None).unwrap();
    assert_eq!(semaphore.available_permits(), 2);
}

#[test]
fn concurrency_never_exceeds_the_permit_count() {
    const PERMITS: usize = 3;
    const THREADS: usize = 12;
    const ROUNDS: usize = 200;

    let semaphore = Semaphore::new(PERMITS);
    let active = AtomicUsize::new(0);
    let max_active = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    semaphore.acquire(None).unwrap();
                    let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(current, Ordering::SeqCst);
                    active.fetch_sub(1, Ordering::SeqCst);
                    semaphore.release();
                }
            });
        }
    });
    assert!(max_active.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(semaphore.available_permits(), PERMITS);
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn pruning_variant_conserves_permits_under_contention() {
    const PERMITS: usize = 2;
    const THREADS: usize = 8;
    const ROUNDS: usize = 300;

    let semaphore = PruningSemaphore::new(PERMITS);
    let active = AtomicUsize::new(0);
    let max_active = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let mut rng = new_rng();
                for _ in 0..ROUNDS {
                    semaphore.acquire(None).unwrap();
                    let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(current, Ordering::SeqCst);
                    if rng.gen_ratio(1, 8) {
                        thread::yield_now();
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    semaphore.release();
                }
            });
        }
    });
    assert!(max_active.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(semaphore.available_permits(), PERMITS);
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn queue_survives_many_segments_of_waiters() {
    // More waiters than one 256-cell segment holds, drained in order.
    const WAITERS: usize = 600;

    let semaphore = Arc::new(Semaphore::new(0));
    let resumed = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    for _ in 0..WAITERS {
        let semaphore = Arc::clone(&semaphore);
        let resumed = Arc::clone(&resumed);
        waiters.push(thread::spawn(move || {
            semaphore.acquire(None).unwrap();
            resumed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    wait_for_waiters(|| semaphore.waiting_count(), WAITERS);
    semaphore.release_n(WAITERS);
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(resumed.load(Ordering::SeqCst), WAITERS);
    assert_eq!(semaphore.available_permits(), 0);
    assert_eq!(semaphore.waiting_count(), 0);
}
