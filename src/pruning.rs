//! The segment-pruning counting semaphore.

use crate::cancel::CancelToken;
use crate::error::Cancelled;
use crate::queue::pruning::PruningQueue;
use crate::queue::SemQueue;
use crate::waiter::{self, WaitFuture};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A FIFO counting semaphore that physically unlinks fully-cancelled queue
/// segments.
///
/// Operationally identical to [`Semaphore`](crate::Semaphore): strict FIFO
/// hand-off, a one-instruction fast path, blocking and async acquisition out
/// of the same lock-free queue. The difference is in how cancelled waiters
/// are reclaimed. This variant uses small 16-cell, doubly-linked segments
/// and removes a segment from the middle of the queue as soon as every cell
/// in it has been cancelled, so a workload that abandons large stretches of
/// the queue (per-request timeouts, mass cancellation on shutdown) does not
/// make later releasers walk an arbitrarily long trail of dead cells, nor
/// keep it resident.
///
/// # Examples
///
/// ```
/// use segsem::{CancelToken, PruningSemaphore};
///
/// let semaphore = PruningSemaphore::new(0);
/// let token = CancelToken::new();
/// token.cancel();
/// assert!(!semaphore.try_acquire(Some(&token)));
/// semaphore.release();
/// assert_eq!(semaphore.available_permits(), 1);
/// ```
#[derive(Debug)]
pub struct PruningSemaphore {
    queue: PruningQueue,
}

impl PruningSemaphore {
    /// Creates a semaphore with `permits` permits available. `0` is allowed;
    /// the first acquirer then waits for the first
    /// [`release`](PruningSemaphore::release).
    ///
    /// # Panics
    ///
    /// If `permits` exceeds `i32::MAX`.
    pub fn new(permits: usize) -> Self {
        PruningSemaphore {
            queue: PruningQueue::with_permits(permits),
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
    /// [`release`](PruningSemaphore::release).
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

/// The future returned by [`PruningSemaphore::acquire_async`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'a> {
    inner: WaitFuture<'a, PruningQueue>,
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

/// The future returned by [`PruningSemaphore::try_acquire_async`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct TryAcquire<'a> {
    inner: WaitFuture<'a, PruningQueue>,
}

impl Future for TryAcquire<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.get_mut().inner).poll(cx)
    }
}
