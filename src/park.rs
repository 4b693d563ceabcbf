//! Futex-backed parking for blocking waiters.
//!
//! Each OS thread owns one [`ParkEvent`], cached in a thread-local so that a
//! blocking acquire allocates nothing after the first wait on that thread.
//! The event doubles as a [`Waker`]: a releaser that resolves a blocking
//! waiter's completion cell sets the futex word directly on its own thread,
//! which is what keeps blocking callers safe when every executor worker is
//! itself parked in an acquire.

use atomic_wait::{wait, wake_one};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};

const IDLE: u32 = 0;
const NOTIFIED: u32 = 1;

/// A single-shot, resettable event for one parked thread.
#[derive(Debug)]
pub(crate) struct ParkEvent {
    state: AtomicU32,
}

impl ParkEvent {
    fn new() -> Self {
        ParkEvent {
            state: AtomicU32::new(IDLE),
        }
    }

    /// Wake the parked owner, or make its next `wait` return immediately.
    pub(crate) fn set(&self) {
        self.state.store(NOTIFIED, Ordering::Release);
        wake_one(&self.state);
    }

    /// Park until `set` is called. Consumes the notification on return; the
    /// caller re-checks its condition in a loop, so stale notifications from
    /// a previous wait are harmless.
    pub(crate) fn wait(&self) {
        wait(&self.state, IDLE);
        self.state.store(IDLE, Ordering::Relaxed);
    }
}

impl Wake for ParkEvent {
    fn wake(self: Arc<Self>) {
        self.set();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.set();
    }
}

thread_local! {
    static EVENT: Arc<ParkEvent> = Arc::new(ParkEvent::new());
}

/// This thread's pooled park event.
pub(crate) fn thread_event() -> Arc<ParkEvent> {
    EVENT.with(Arc::clone)
}

/// A waker that sets the event inline on the waking thread.
pub(crate) fn event_waker(event: &Arc<ParkEvent>) -> Waker {
    Waker::from(Arc::clone(event))
}
