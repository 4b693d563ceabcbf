//! Reusable completion cells and the pool they are rented from.
//!
//! A [`Completion`] is a one-shot boolean handoff between a releaser and
//! exactly one waiter: `true` means a permit was delivered, `false` means the
//! wait was cancelled. The same cell serves blocking and asynchronous
//! callers; the difference is only in which kind of waker gets registered.
//! Cells are reused across acquisitions, so every use is tagged with a
//! version and stale-version access is rejected rather than misdelivered.

use crate::error::InvalidState;
use futures::task::AtomicWaker;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;

const TAG_BITS: u32 = 2;
const TAG_MASK: u32 = (1 << TAG_BITS) - 1;

const PENDING: u32 = 0;
const READY_FALSE: u32 = 1;
const READY_TRUE: u32 = 2;
const CONSUMED: u32 = 3;

pub(crate) type CompletionRef = Arc<Completion>;

/// A reusable one-shot boolean handoff.
///
/// State machine: `PENDING -> READY_TRUE | READY_FALSE -> CONSUMED`, then
/// back to `PENDING` with a bumped version on reset. The packed word is
/// `version << 2 | tag`.
#[derive(Debug)]
pub(crate) struct Completion {
    state: AtomicU32,
    waker: AtomicWaker,
}

impl Completion {
    fn new() -> Self {
        Completion {
            state: AtomicU32::new(PENDING),
            waker: AtomicWaker::new(),
        }
    }

    /// The version of the current (pending) use. Snapshotted by the renter
    /// before the cell is published anywhere.
    pub(crate) fn version(&self) -> u32 {
        self.state.load(Ordering::Acquire) >> TAG_BITS
    }

    /// Deliver the result. Exactly one party may call this per version: the
    /// releaser that swapped the cell's queue slot, or the cancelling waiter
    /// that won its handshake. A second resolve is a bug, not a no-op.
    pub(crate) fn resolve(&self, result: bool) {
        let tag = if result { READY_TRUE } else { READY_FALSE };
        let state = self.state.load(Ordering::Acquire);
        assert_eq!(state & TAG_MASK, PENDING, "completion resolved twice");
        self.state.store((state & !TAG_MASK) | tag, Ordering::Release);
        self.waker.wake();
    }

    /// Register the continuation to run on resolve. Callers re-check
    /// [`poll_result`](Self::poll_result) after registering; the
    /// register/wake race is handled by the underlying [`AtomicWaker`].
    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Read the result without consuming it. `Ok(None)` while pending.
    pub(crate) fn poll_result(&self, version: u32) -> Result<Option<bool>, InvalidState> {
        let state = self.state.load(Ordering::Acquire);
        if state >> TAG_BITS != version {
            return Err(InvalidState);
        }
        match state & TAG_MASK {
            PENDING => Ok(None),
            READY_TRUE => Ok(Some(true)),
            READY_FALSE => Ok(Some(false)),
            _ => Err(InvalidState),
        }
    }

    /// Consume the result exactly once, transitioning to `CONSUMED`. Fails on
    /// a stale version, on an unresolved cell, and on double consumption.
    pub(crate) fn consume(&self, version: u32) -> Result<bool, InvalidState> {
        let state = self.state.load(Ordering::Acquire);
        if state >> TAG_BITS != version {
            return Err(InvalidState);
        }
        let result = match state & TAG_MASK {
            READY_TRUE => true,
            READY_FALSE => false,
            _ => return Err(InvalidState),
        };
        self.state
            .compare_exchange(
                state,
                (state & !TAG_MASK) | CONSUMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| InvalidState)?;
        Ok(result)
    }

    /// Bump the version and clear every field. Only called by the sole owner
    /// of a consumed cell, on its way back to the pool.
    fn reset(&self) {
        let state = self.state.load(Ordering::Acquire);
        debug_assert_eq!(state & TAG_MASK, CONSUMED, "reset of an unconsumed completion");
        self.waker.take();
        let version = (state >> TAG_BITS).wrapping_add(1) & (u32::MAX >> TAG_BITS);
        self.state.store(version << TAG_BITS, Ordering::Release);
    }
}

// === pool ===
//
// Two tiers, like the queue-node pools in the channel implementations this
// crate is modelled on: a per-thread slot that needs no synchronisation at
// all, then a small array of shared slots exchanged with single-word swaps.
// Misses allocate; the pool never blocks.

const SHARED_SLOTS: usize = 8;

struct SharedSlot(AtomicPtr<Completion>);

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: SharedSlot = SharedSlot(AtomicPtr::new(ptr::null_mut()));

static SHARED: [SharedSlot; SHARED_SLOTS] = [EMPTY_SLOT; SHARED_SLOTS];
static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static LOCAL_SLOT: Cell<Option<CompletionRef>> = const { Cell::new(None) };
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARED_SLOTS;
}

fn shard() -> &'static SharedSlot {
    &SHARED[SHARD.with(|s| *s)]
}

/// Rent a pending completion cell: thread-local slot, then the shared slot
/// for this thread's shard, then a fresh allocation.
pub(crate) fn rent() -> CompletionRef {
    if let Some(cell) = LOCAL_SLOT.with(Cell::take) {
        return cell;
    }
    let stashed = shard().0.swap(ptr::null_mut(), Ordering::Acquire);
    if !stashed.is_null() {
        // Safety: a non-null shared slot owns one reference, produced by
        // `Arc::into_raw` in `give_back`.
        return unsafe { Arc::from_raw(stashed) };
    }
    Arc::new(Completion::new())
}

/// Reset a consumed cell and return it to the pool.
pub(crate) fn recycle(cell: CompletionRef) {
    cell.reset();
    give_back(cell);
}

/// Return a cell whose current version was never resolved (the acquire
/// completed immediately). No reset needed; the version was never handed out.
pub(crate) fn give_back_unused(cell: CompletionRef) {
    debug_assert_eq!(cell.state.load(Ordering::Acquire) & TAG_MASK, PENDING);
    give_back(cell);
}

fn give_back(cell: CompletionRef) {
    // A resolver may transiently hold a second reference; such a cell cannot
    // be handed to a new renter yet, so it is simply dropped.
    if Arc::strong_count(&cell) != 1 {
        return;
    }
    let leftover = LOCAL_SLOT.with(move |slot| match slot.take() {
        None => {
            slot.set(Some(cell));
            None
        }
        Some(occupant) => {
            slot.set(Some(occupant));
            Some(cell)
        }
    });
    let Some(cell) = leftover else { return };
    let raw = Arc::into_raw(cell) as *mut Completion;
    if shard()
        .0
        .compare_exchange(ptr::null_mut(), raw, Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        // Both tiers full; let the allocation go.
        // Safety: `raw` came from `Arc::into_raw` just above.
        unsafe { drop(Arc::from_raw(raw)) };
    }
}
