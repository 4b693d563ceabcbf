//! The simple-segment counting semaphore.

use crate::cancel::CancelToken;
use crate::error::Cancelled;
use crate::queue::simple::SimpleQueue;
use crate::queue::SemQueue;
use crate::waiter::{self, WaitFuture};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A FIFO counting semaphore for mixed blocking and async workloads.
///
/// Permits are handed out in strict first-in-first-out order of arrival,
/// whether a waiter blocks its OS thread ([`acquire`]) or suspends its task
/// ([`acquire_async`]). The fast path is a single atomic instruction; queued
/// waiters live in a lock-free list of 256-cell segments, so heavy
/// contention never serialises on a mutex, and waiting is allocation-free
/// once the per-thread pools are warm.
///
/// This variant keeps cancelled waiters' cells in place until a releaser
/// walks past them. For workloads that cancel large numbers of queued
/// waiters (timeout-heavy systems), [`PruningSemaphore`] additionally
/// unlinks fully-cancelled segments.
///
/// There is no upper bound on permits: `release` is not validated against
/// the constructor value.
///
/// # Examples
///
/// Limiting concurrency across threads:
///
/// ```
/// use segsem::Semaphore;
/// use std::sync::Arc;
/// use std::thread;
///
/// let semaphore = Arc::new(Semaphore::new(2));
/// let mut workers = Vec::new();
/// for _ in 0..8 {
///     let semaphore = Arc::clone(&semaphore);
///     workers.push(thread::spawn(move || {
///         semaphore.acquire(None).unwrap();
///         // at most two workers run here at once
///         semaphore.release();
///     }));
/// }
/// for worker in workers {
///     worker.join().unwrap();
/// }
/// assert_eq!(semaphore.available_permits(), 2);
/// ```
///
/// The same semaphore from async code:
///
/// ```
/// use segsem::Semaphore;
///
/// let semaphore = Semaphore::new(1);
/// futures::executor::block_on(async {
///     semaphore.acquire_async(None).await.unwrap();
///     semaphore.release();
/// });
/// ```
///
/// [`acquire`]: Semaphore::acquire
/// [`acquire_async`]: Semaphore::acquire_async
/// [`PruningSemaphore`]: crate::PruningSemaphore
#[derive(Debug)]
pub struct Semaphore {
    queue: SimpleQueue,
}

impl Semaphore {
    /// Creates a semaphore with `permits` permits available. `0` is allowed;
    /// the first acquirer then waits for the first [`release`].
    ///
    /// # Panics
    ///
    /// If `permits` exceeds `i32::MAX`.
    ///
    /// [`release`]: Semaphore::release
    pub fn new(permits: usize) -> Self {
        Semaphore {
            queue: SimpleQueue::with_permits(permits),
        }
    }

    /// Acquires a permit, blocking the calling thread until one is
    /// available.
    ///
    /// Fails only if `token` fires before a permit is delivered; with
    /// `None` this never returns an error.
    pub fn acquire(&self, token: Option<&CancelToken>) -> Result<(), Cancelled> {
        waiter::acquire_blocking(&self.queue, token)
    }

    /// Acquires a permit, blocking the calling thread; reports cancellation
    /// as `false` instead of an error. With `None` this blocks until a
    /// permit arrives and always returns `true`.
    pub fn try_acquire(&self, token: Option<&CancelToken>) -> bool {
        waiter::acquire_blocking(&self.queue, token).is_ok()
    }

    /// Acquires a permit, suspending the calling task until one is
    /// available.
    ///
    /// Dropping the returned future before it completes gives up the queue
    /// slot; a permit that raced the drop is released back, never lost.
    pub fn acquire_async<'a>(&'a self, token: Option<&'a CancelToken>) -> Acquire<'a> {
        Acquire {
            inner: WaitFuture::new(&self.queue, token),
        }
    }

    /// Acquires a permit, suspending the calling task; reports cancellation
    /// as `false` instead of an error. With `None` the future only resolves
    /// once a permit arrives, and always to `true`.
    pub fn try_acquire_async<'a>(&'a self, token: Option<&'a CancelToken>) -> TryAcquire<'a> {
        TryAcquire {
            inner: WaitFuture::new(&self.queue, token),
        }
    }

    /// Acquires a permit only if one is available right now. Never blocks,
    /// never suspends, never joins the queue.
    pub fn try_acquire_now(&self) -> bool {
        self.queue.try_acquire_now()
    }

    /// Returns one permit, resuming the longest-waiting live acquirer if
    /// there is one.
    ///
    /// Over-release is not validated: releasing more than was ever acquired
    /// simply raises the permit count.
    pub fn release(&self) {
        self.queue.release();
    }

    /// Returns `n` permits. Equivalent to `n` calls to
    /// [`release`](Semaphore::release).
    pub fn release_n(&self, n: usize) {
        for _ in 0..n {
            self.queue.release();
        }
    }

    /// The number of permits currently available for immediate acquisition.
    pub fn available_permits(&self) -> usize {
        self.queue.available_permits()
    }

    /// The number of acquirers currently waiting in the queue.
    pub fn waiting_count(&self) -> usize {
        self.queue.waiting_count()
    }

    #[doc(hidden)]
    pub fn segment_count(&self) -> usize {
        self.queue.segment_count()
    }
}

/// The future returned by [`Semaphore::acquire_async`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'a> {
    inner: WaitFuture<'a, SimpleQueue>,
}

impl Future for Acquire<'_> {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(cx).map(|acquired| {
            if acquired {
                Ok(())
            } else {
                Err(Cancelled::new())
            }
        })
    }
}

/// The future returned by [`Semaphore::try_acquire_async`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct TryAcquire<'a> {
    inner: WaitFuture<'a, SimpleQueue>,
}

impl Future for TryAcquire<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.get_mut().inner).poll(cx)
    }
}
