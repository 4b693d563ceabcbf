//! The shared permit counter.
//!
//! Positive values are permits available for immediate acquisition; negative
//! values approximate the number of waiters queued behind the semaphore. A
//! decrement that crosses zero does not acquire a permit, it reserves a slot
//! in the waiter queue.

use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug)]
pub(crate) struct PermitCounter(AtomicI32);

impl PermitCounter {
    pub(crate) fn new(permits: usize) -> Self {
        assert!(
            permits <= i32::MAX as usize,
            "a semaphore may not hold more than i32::MAX permits",
        );
        PermitCounter(AtomicI32::new(permits as i32))
    }

    /// Take one permit. Returns true if the pre-decrement value was positive,
    /// i.e. a permit was actually available; otherwise the caller now owns a
    /// slot in the waiter queue.
    pub(crate) fn try_decrement(&self) -> bool {
        self.0.fetch_add(-1, Ordering::AcqRel) > 0
    }

    /// Give one permit back. Returns true if the post-increment value is
    /// positive, i.e. no waiter needs to be resumed.
    ///
    /// Over-release is not validated; the counter wraps like any `i32`.
    pub(crate) fn try_increment(&self) -> bool {
        self.0.fetch_add(1, Ordering::AcqRel) + 1 > 0
    }

    /// Compensating increment used by the cancellation path: adds one only
    /// while the counter is negative, so a cancelled waiter's reserved slot
    /// is handed back without minting a permit out of thin air.
    pub(crate) fn increment_when_negative(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >= 0 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take one permit only if one is available right now. Never goes
    /// negative, so it can never reserve a queue slot.
    pub(crate) fn try_decrement_when_positive(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Permits available for immediate acquisition.
    pub(crate) fn available(&self) -> usize {
        self.0.load(Ordering::Acquire).max(0) as usize
    }

    /// Queue slots currently reserved, i.e. `max(0, -counter)`.
    pub(crate) fn shortfall(&self) -> usize {
        (-self.0.load(Ordering::Acquire)).max(0) as usize
    }
}
