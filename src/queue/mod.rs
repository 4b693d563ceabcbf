//! Lock-free segment queues backing the semaphores.
//!
//! Both variants share one cell alphabet. A cell is a single atomic word
//! holding either a sentinel or a pointer to the waiter's completion cell;
//! all transitions are CAS or swap:
//!
//! - `EMPTY`: initial state.
//! - `PERMIT`: a releaser deposited a permit before the acquirer arrived.
//! - `CANCELED`: the acquirer that owned this cell gave up.
//! - anything else: a `Completion` pointer installed by a queued acquirer.
//!
//! Any other observation is memory corruption and fails fast.

pub(crate) mod pruning;
pub(crate) mod simple;

use crate::completion::{Completion, CompletionRef};
use std::sync::Arc;

pub(crate) const EMPTY: usize = 0;
pub(crate) const PERMIT: usize = 1;
pub(crate) const CANCELED: usize = 2;

// The sentinels must be distinguishable from real pointers.
const _: () = assert!(std::mem::align_of::<Completion>() >= 4);

/// Take one owned reference out of `cell` and encode it as a cell word.
pub(crate) fn completion_word(cell: &CompletionRef) -> usize {
    Arc::into_raw(Arc::clone(cell)) as usize
}

/// Decode a cell word back into the owned reference produced by
/// [`completion_word`].
///
/// # Safety
///
/// `word` must be a value previously returned by `completion_word` whose
/// reference has not yet been reclaimed, i.e. the caller must have won the
/// atomic exchange that removed it from its cell.
pub(crate) unsafe fn completion_from_word(word: usize) -> CompletionRef {
    Arc::from_raw(word as *const Completion)
}

/// A cell held something outside the permitted alphabet; the queue state is
/// corrupted and continuing would misdeliver permits.
pub(crate) fn unreachable_cell(word: usize) -> ! {
    panic!("corrupted semaphore cell: {word:#x}");
}

/// A queued waiter's claim on one cell. The segment pointer stays valid for
/// the lifetime of the slot because installation took a reference on the
/// segment, released by the queue's `release_slot`.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) completion: CompletionRef,
    pub(crate) version: u32,
    pub(crate) word: usize,
    pub(crate) segment: *const (),
    pub(crate) index: usize,
}

// Safety: the raw segment pointer is kept alive by the reference count taken
// at install time; the queue implementations are the only dereferencers.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// Outcome of installing a completion into the next enqueue slot.
#[derive(Debug)]
pub(crate) enum Install {
    /// A releaser had already deposited a permit into the claimed cell.
    Acquired,
    /// The waiter is queued and must wait on its completion.
    Queued(Slot),
}

/// Outcome of the cancellation handshake on an owned cell.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// The handshake won; the waiter is out of the queue.
    Cancelled,
    /// A permit was concurrently delivered; the cancellation loses and the
    /// waiter's completion resolves `true` momentarily.
    PermitArrived,
}

/// The per-variant queue protocol shared by the public semaphore types.
pub(crate) trait SemQueue: Send + Sync + std::fmt::Debug {
    fn with_permits(permits: usize) -> Self;

    /// Counter fast path: take a permit or reserve a queue slot.
    fn try_acquire_fast(&self) -> bool;

    /// Counter-only immediate acquisition; never reserves a slot.
    fn try_acquire_now(&self) -> bool;

    /// Return one permit, resuming the next live waiter if there is one.
    fn release(&self);

    /// Claim the next enqueue index and install `completion` into its cell.
    fn install(&self, completion: &CompletionRef) -> Install;

    /// Run the cancellation handshake for a queued waiter.
    fn cancel_cell(&self, slot: &Slot) -> CancelOutcome;

    /// Drop the segment reference held by `slot`.
    fn release_slot(&self, slot: &Slot);

    fn available_permits(&self) -> usize;

    fn waiting_count(&self) -> usize;

    /// Number of segments still serving the queue; diagnostic only.
    fn segment_count(&self) -> usize;
}
