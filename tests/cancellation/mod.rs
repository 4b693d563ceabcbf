use crate::{poll_once, FlagWaker};
use segsem::{CancelToken, PruningSemaphore, Semaphore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;
use test_log::test;

#[test]
fn cancelled_head_is_skipped_by_the_next_release() {
    let semaphore = Semaphore::new(0);
    let token_a = CancelToken::new();
    let wakers: Vec<_> = (0..3).map(|_| FlagWaker::new()).collect();
    let mut a = semaphore.acquire_async(Some(&token_a));
    let mut b = semaphore.acquire_async(None);
    let mut c = semaphore.acquire_async(None);
    assert!(poll_once(&mut a, &wakers[0].waker()).is_pending());
    assert!(poll_once(&mut b, &wakers[1].waker()).is_pending());
    assert!(poll_once(&mut c, &wakers[2].waker()).is_pending());

    token_a.cancel();
    assert!(wakers[0].take(), "cancellation must wake the waiter");
    assert!(matches!(
        poll_once(&mut a, &wakers[0].waker()),
        Poll::Ready(Err(_))
    ));

    semaphore.release();
    assert!(wakers[1].take(), "the permit must skip the cancelled head");
    assert!(!wakers[2].woken());
    assert_eq!(poll_once(&mut b, &wakers[1].waker()), Poll::Ready(Ok(())));
    assert_eq!(semaphore.waiting_count(), 1);
    drop(c);
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn pruning_variant_skips_a_cancelled_head_too() {
    let semaphore = PruningSemaphore::new(0);
    let token = CancelToken::new();
    let waker = FlagWaker::new();
    let mut a = semaphore.acquire_async(Some(&token));
    let mut b = semaphore.acquire_async(None);
    assert!(poll_once(&mut a, &waker.waker()).is_pending());
    assert!(poll_once(&mut b, &waker.waker()).is_pending());
    assert_eq!(semaphore.waiting_count(), 2);

    token.cancel();
    assert!(matches!(poll_once(&mut a, &waker.waker()), Poll::Ready(Err(_))));
    assert_eq!(semaphore.waiting_count(), 1);

    semaphore.release();
    assert_eq!(poll_once(&mut b, &waker.waker()), Poll::Ready(Ok(())));
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn cancellation_of_a_blocked_thread_is_prompt() {
    let semaphore = Arc::new(Semaphore::new(0));
    let token = CancelToken::new();
    let waiter = {
        let semaphore = Arc::clone(&semaphore);
        let token = token.clone();
        thread::spawn(move || semaphore.acquire(Some(&token)))
    };
    while semaphore.waiting_count() < 1 {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(20));
    token.cancel();
    // no release ever happens; the join itself is the promptness check
    assert!(waiter.join().unwrap().is_err());
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn try_acquire_reports_cancellation_as_false() {
    let semaphore = Semaphore::new(0);
    let token = CancelToken::new();
    token.cancel();
    assert!(!semaphore.try_acquire(Some(&token)));

    let waker = FlagWaker::new();
    let mut future = semaphore.try_acquire_async(Some(&token));
    assert_eq!(poll_once(&mut future, &waker.waker()), Poll::Ready(false));
}

#[test]
fn cancel_and_release_race_loses_no_permit() {
    // Run the race many times; every outcome must satisfy: the waiter got
    // the permit and the count stayed 0, or the waiter was cancelled and the
    // permit survived somewhere reachable.
    for _ in 0..200 {
        let semaphore = Arc::new(Semaphore::new(0));
        let token = CancelToken::new();
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            thread::spawn(move || semaphore.try_acquire(Some(&token)))
        };
        while semaphore.waiting_count() < 1 {
            thread::yield_now();
        }
        let releaser = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || semaphore.release())
        };
        let canceller = thread::spawn(move || token.cancel());
        let acquired = waiter.join().unwrap();
        releaser.join().unwrap();
        canceller.join().unwrap();

        if acquired {
            assert_eq!(semaphore.available_permits(), 0);
        } else {
            // the permit must still be acquirable without a further release
            assert!(semaphore.acquire(None).is_ok());
        }
    }
}

#[test]
fn dropping_a_queued_future_leaves_the_queue() {
    let semaphore = PruningSemaphore::new(0);
    let waker = FlagWaker::new();
    let mut future = semaphore.acquire_async(None);
    assert!(poll_once(&mut future, &waker.waker()).is_pending());
    assert_eq!(semaphore.waiting_count(), 1);
    drop(future);
    assert_eq!(semaphore.waiting_count(), 0);
    // a release now finds no waiter and banks the permit
    semaphore.release();
    assert_eq!(semaphore.available_permits(), 1);
}

#[test]
fn dropping_a_resolved_future_returns_its_permit() {
    let semaphore = Semaphore::new(0);
    let waker = FlagWaker::new();
    let mut future = semaphore.acquire_async(None);
    assert!(poll_once(&mut future, &waker.waker()).is_pending());
    // the release hands the permit to the queued future...
    semaphore.release();
    assert!(waker.woken());
    // ...which is dropped without ever observing it
    drop(future);
    // the permit must come back rather than vanish
    assert!(semaphore.try_acquire_now());
}

#[test]
fn cancelling_after_acquisition_is_a_no_op() {
    let semaphore = Semaphore::new(1);
    let token = CancelToken::new();
    assert!(semaphore.try_acquire(Some(&token)));
    token.cancel();
    assert_eq!(semaphore.available_permits(), 0);
    semaphore.release();
    assert_eq!(semaphore.available_permits(), 1);
}

#[test]
fn one_token_cancels_many_waiters() {
    let semaphore = Arc::new(Semaphore::new(0));
    let token = CancelToken::new();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    for _ in 0..8 {
        let semaphore = Arc::clone(&semaphore);
        let token = token.clone();
        let cancelled = Arc::clone(&cancelled);
        waiters.push(thread::spawn(move || {
            if !semaphore.try_acquire(Some(&token)) {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    while semaphore.waiting_count() < 8 {
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(20));
    token.cancel();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(cancelled.load(Ordering::SeqCst), 8);
    assert_eq!(semaphore.waiting_count(), 0);
}

#[test]
fn fully_cancelled_segment_is_pruned() {
    // 16-cell segments: two segments of cancellable waiters, then cancel the
    // whole first segment.
    const SEGMENT: usize = 16;

    let semaphore = PruningSemaphore::new(0);
    let first_tokens: Vec<_> = (0..SEGMENT).map(|_| CancelToken::new()).collect();
    let waker = FlagWaker::new();

    let mut first: Vec<_> = first_tokens
        .iter()
        .map(|token| semaphore.acquire_async(Some(token)))
        .collect();
    let mut second: Vec<_> = (0..SEGMENT).map(|_| semaphore.acquire_async(None)).collect();
    for future in first.iter_mut().chain(second.iter_mut()) {
        assert!(poll_once(future, &waker.waker()).is_pending());
    }
    assert_eq!(semaphore.segment_count(), 2);
    assert_eq!(semaphore.waiting_count(), 2 * SEGMENT);

    for (token, future) in first_tokens.iter().zip(first.iter_mut()) {
        token.cancel();
        assert!(matches!(poll_once(future, &waker.waker()), Poll::Ready(Err(_))));
    }
    drop(first);
    assert_eq!(semaphore.segment_count(), 1);
    assert_eq!(semaphore.waiting_count(), SEGMENT);

    // the queue still works: releases reach the second segment
    semaphore.release();
    let resumed = second
        .iter_mut()
        .map(|future| poll_once(future, &waker.waker()))
        .filter(|poll| matches!(poll, Poll::Ready(Ok(()))))
        .count();
    assert_eq!(resumed, 1);
}
