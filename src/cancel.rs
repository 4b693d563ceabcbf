//! Cancellation signals for acquire operations.

use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

/// A cloneable, level-triggered cancellation signal.
///
/// Pass a token to the cancellable acquire operations; calling
/// [`cancel`](CancelToken::cancel) from any thread promptly completes every
/// wait associated with the token, as an error for the `acquire` family and
/// as `false` for the `try_acquire` family. Cancelling after a permit has
/// already been delivered has no effect on that permit.
///
/// Timeouts are not built in: express a timeout by cancelling a token from a
/// timer.
///
/// # Examples
///
/// ```
/// use segsem::{CancelToken, Semaphore};
///
/// let sem = Semaphore::new(0);
/// let token = CancelToken::new();
/// token.cancel();
/// assert!(!sem.try_acquire(Some(&token)));
/// ```
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    watchers: Mutex<WatcherSet>,
}

/// Waker registry with slot reuse, so the common one-waiter case never
/// reallocates.
#[derive(Debug, Default)]
struct WatcherSet {
    slots: SmallVec<[Option<Waker>; 4]>,
    free: SmallVec<[usize; 4]>,
}

/// Handle to one registered watcher.
#[derive(Debug)]
pub(crate) struct WatchKey(usize);

impl CancelToken {
    /// Creates a token in the non-cancelled state.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                watchers: Mutex::new(WatcherSet::default()),
            }),
        }
    }

    /// Fire the signal. Idempotent; wakes every currently-registered waiter.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let wakers: SmallVec<[Waker; 4]> = {
            let mut set = self.inner.watchers.lock().unwrap();
            set.free.clear();
            set.slots.drain(..).flatten().collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a waker to be woken on cancel. Returns `None` if the token
    /// already fired, in which case the caller sees `is_cancelled` itself.
    pub(crate) fn watch(&self, waker: &Waker) -> Option<WatchKey> {
        let mut set = self.inner.watchers.lock().unwrap();
        // Checked under the lock: `cancel` sets the flag before draining, so
        // an insert either lands before the drain or observes the flag.
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        let key = match set.free.pop() {
            Some(index) => {
                set.slots[index] = Some(waker.clone());
                index
            }
            None => {
                set.slots.push(Some(waker.clone()));
                set.slots.len() - 1
            }
        };
        Some(WatchKey(key))
    }

    /// Replace the waker behind a key; used by futures re-polled with a new
    /// task context.
    pub(crate) fn rewatch(&self, key: &WatchKey, waker: &Waker) {
        let mut set = self.inner.watchers.lock().unwrap();
        if let Some(slot) = set.slots.get_mut(key.0) {
            if let Some(existing) = slot {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
            }
        }
    }

    pub(crate) fn unwatch(&self, key: WatchKey) {
        let mut set = self.inner.watchers.lock().unwrap();
        if let Some(slot) = set.slots.get_mut(key.0) {
            if slot.take().is_some() {
                set.free.push(key.0);
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}
