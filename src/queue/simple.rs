//! The simple segment queue: 256-cell singly-linked segments.
//!
//! Segments are never unlinked from the middle of the list. A segment is
//! reclaimed once every one of its cells has been exchanged by both sides
//! (enqueue and dequeue) and nothing holds a reference to it any more; each
//! queue head and each queued waiter counts as one reference. Epoch-based
//! reclamation covers the raw traversals in between.

use super::{
    completion_from_word, completion_word, unreachable_cell, CancelOutcome, Install, SemQueue,
    Slot, CANCELED, EMPTY, PERMIT,
};
use crate::completion::CompletionRef;
use crate::counter::PermitCounter;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

pub(crate) const SEGMENT_SIZE: usize = 256;

/// One enqueue-side and one dequeue-side exchange per cell.
const ALL_EVENTS: u32 = 2 * SEGMENT_SIZE as u32;

pub(super) struct Segment {
    id: u64,
    next: Atomic<Segment>,
    /// Live references: one per head pointing here, one per queued waiter.
    refs: AtomicU32,
    /// Completed cell exchanges, up to [`ALL_EVENTS`].
    events: AtomicU32,
    /// Physical retirement happens exactly once.
    claimed: AtomicBool,
    cells: [AtomicUsize; SEGMENT_SIZE],
}

impl Segment {
    fn new(id: u64, refs: u32) -> Segment {
        Segment {
            id,
            next: Atomic::null(),
            refs: AtomicU32::new(refs),
            events: AtomicU32::new(0),
            claimed: AtomicBool::new(false),
            cells: std::array::from_fn(|_| AtomicUsize::new(EMPTY)),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Reclaim completion references abandoned in cells, e.g. by a
        // forgotten acquire future.
        for cell in &mut self.cells {
            let word = *cell.get_mut();
            if word > CANCELED {
                unsafe { drop(completion_from_word(word)) };
            }
        }
    }
}

thread_local! {
    /// Segments that lost a tail-append race, kept for the next append.
    static SPARE: Cell<Option<Box<Segment>>> = const { Cell::new(None) };
}

fn fresh_segment(id: u64) -> Owned<Segment> {
    match SPARE.with(Cell::take) {
        Some(mut spare) => {
            // A spare was never linked or published, so everything but its id
            // is still in the initial state.
            spare.id = id;
            Owned::from(spare)
        }
        None => Owned::new(Segment::new(id, 0)),
    }
}

fn stash_spare(spare: Owned<Segment>) {
    SPARE.with(|slot| slot.set(Some(spare.into_box())));
}

fn add_ref(s: Shared<'_, Segment>) {
    unsafe { s.deref() }.refs.fetch_add(1, Ordering::AcqRel);
}

fn release_ref(s: Shared<'_, Segment>, guard: &Guard) {
    if unsafe { s.deref() }.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        maybe_retire(s, guard);
    }
}

/// Count one completed exchange on a cell of `s`.
fn record_event(s: Shared<'_, Segment>, guard: &Guard) {
    let events = unsafe { s.deref() }.events.fetch_add(1, Ordering::AcqRel) + 1;
    debug_assert!(events <= ALL_EVENTS);
    if events == ALL_EVENTS {
        maybe_retire(s, guard);
    }
}

/// Retire a fully-exchanged, unreferenced segment exactly once. Both heads
/// are necessarily past it: a head still pointing here would hold a
/// reference, and a head behind it would imply an unexchanged cell.
fn maybe_retire(s: Shared<'_, Segment>, guard: &Guard) {
    let seg = unsafe { s.deref() };
    if seg.events.load(Ordering::Acquire) == ALL_EVENTS
        && seg.refs.load(Ordering::Acquire) == 0
        && !seg.claimed.swap(true, Ordering::AcqRel)
    {
        trace!(segment = seg.id, "retiring segment");
        unsafe { guard.defer_destroy(s) };
    }
}

/// Walk from `start` towards the segment with the given id, appending fresh
/// segments at the tail as needed. `start` must be a head snapshot taken
/// before the caller claimed its index, which guarantees `start.id <= id`.
fn locate<'g>(start: Shared<'g, Segment>, id: u64, guard: &'g Guard) -> Shared<'g, Segment> {
    let mut current = start;
    loop {
        let seg = unsafe { current.deref() };
        if seg.id >= id {
            return current;
        }
        let next = seg.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            current = next;
            continue;
        }
        let fresh = fresh_segment(seg.id + 1);
        match seg
            .next
            .compare_exchange(Shared::null(), fresh, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => current = installed,
            Err(lost) => {
                stash_spare(lost.new);
                current = lost.current;
            }
        }
    }
}

/// Move `head` forward to `to`, shifting the head's reference from the old
/// segment to the new one.
fn advance<'g>(head: &Atomic<Segment>, to: Shared<'g, Segment>, guard: &'g Guard) {
    let to_id = unsafe { to.deref() }.id;
    add_ref(to);
    loop {
        let current = head.load(Ordering::Acquire, guard);
        if unsafe { current.deref() }.id >= to_id {
            release_ref(to, guard);
            return;
        }
        if head
            .compare_exchange(current, to, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            release_ref(current, guard);
            return;
        }
    }
}

/// The queue state behind [`Semaphore`](crate::Semaphore).
pub(crate) struct SimpleQueue {
    counter: PermitCounter,
    enq_idx: AtomicU64,
    deq_idx: AtomicU64,
    enq_head: Atomic<Segment>,
    deq_head: Atomic<Segment>,
    /// Monotone count of cancelled waiters; `waiting_count` subtracts it
    /// from the counter's shortfall.
    cancelled: AtomicU64,
}

impl std::fmt::Debug for SimpleQueue {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("SimpleQueue")
            .field("counter", &self.counter)
            .field("enq_idx", &self.enq_idx)
            .field("deq_idx", &self.deq_idx)
            .finish_non_exhaustive()
    }
}

impl SemQueue for SimpleQueue {
    fn with_permits(permits: usize) -> Self {
        let guard = epoch::pin();
        // Both heads start on the first segment, hence two references.
        let first = Owned::new(Segment::new(0, 2)).into_shared(&guard);
        SimpleQueue {
            counter: PermitCounter::new(permits),
            enq_idx: AtomicU64::new(0),
            deq_idx: AtomicU64::new(0),
            enq_head: Atomic::from(first),
            deq_head: Atomic::from(first),
            cancelled: AtomicU64::new(0),
        }
    }

    fn try_acquire_fast(&self) -> bool {
        self.counter.try_decrement()
    }

    fn try_acquire_now(&self) -> bool {
        self.counter.try_decrement_when_positive()
    }

    fn release(&self) {
        if self.counter.try_increment() {
            return;
        }
        let guard = epoch::pin();
        loop {
            // Snapshot the head before claiming the index so the snapshot
            // can never be ahead of the claimed segment.
            let start = self.deq_head.load(Ordering::Acquire, &guard);
            let index = self.deq_idx.fetch_add(1, Ordering::Relaxed);
            let id = index / SEGMENT_SIZE as u64;
            let s = locate(start, id, &guard);
            advance(&self.deq_head, s, &guard);
            let seg = unsafe { s.deref() };
            debug_assert_eq!(seg.id, id, "simple segment ids are dense");
            let cell = &seg.cells[(index % SEGMENT_SIZE as u64) as usize];
            let previous = cell.swap(PERMIT, Ordering::AcqRel);
            record_event(s, &guard);
            match previous {
                EMPTY => {
                    // The acquirer has not arrived yet; it will consume the
                    // deposit when it tries to install its completion.
                    trace!(index, "deposited permit");
                    return;
                }
                CANCELED => {
                    trace!(index, "skipped cancelled slot");
                    continue;
                }
                word if word > CANCELED => {
                    let completion = unsafe { completion_from_word(word) };
                    trace!(index, "handing permit to waiter");
                    completion.resolve(true);
                    return;
                }
                word => unreachable_cell(word),
            }
        }
    }

    fn install(&self, completion: &CompletionRef) -> Install {
        let guard = epoch::pin();
        let start = self.enq_head.load(Ordering::Acquire, &guard);
        let index = self.enq_idx.fetch_add(1, Ordering::Relaxed);
        let id = index / SEGMENT_SIZE as u64;
        let s = locate(start, id, &guard);
        advance(&self.enq_head, s, &guard);
        let seg = unsafe { s.deref() };
        debug_assert_eq!(seg.id, id, "simple segment ids are dense");
        // The reference is taken before the cell is published so the segment
        // outlives the whole wait, including the cancellation handshake.
        add_ref(s);
        let version = completion.version();
        let word = completion_word(completion);
        let cell = &seg.cells[(index % SEGMENT_SIZE as u64) as usize];
        let result = cell.compare_exchange(EMPTY, word, Ordering::AcqRel, Ordering::Acquire);
        record_event(s, &guard);
        match result {
            Ok(_) => {
                trace!(index, segment = seg.id, "waiter queued");
                Install::Queued(Slot {
                    completion: Arc::clone(completion),
                    version,
                    word,
                    segment: s.as_raw() as *const (),
                    index: (index % SEGMENT_SIZE as u64) as usize,
                })
            }
            Err(PERMIT) => {
                // A releaser ran ahead and deposited a permit in our cell.
                unsafe { drop(completion_from_word(word)) };
                release_ref(s, &guard);
                trace!(index, "permit was already deposited");
                Install::Acquired
            }
            Err(word) => unreachable_cell(word),
        }
    }

    fn cancel_cell(&self, slot: &Slot) -> CancelOutcome {
        let seg = unsafe { &*(slot.segment as *const Segment) };
        match seg.cells[slot.index].swap(CANCELED, Ordering::AcqRel) {
            word if word == slot.word => {
                unsafe { drop(completion_from_word(word)) };
                self.cancelled.fetch_add(1, Ordering::AcqRel);
                trace!(segment = seg.id, index = slot.index, "waiter cancelled");
                CancelOutcome::Cancelled
            }
            PERMIT => CancelOutcome::PermitArrived,
            word => unreachable_cell(word),
        }
    }

    fn release_slot(&self, slot: &Slot) {
        let guard = epoch::pin();
        let s = Shared::from(slot.segment as *const Segment);
        release_ref(s, &guard);
    }

    fn available_permits(&self) -> usize {
        self.counter.available()
    }

    fn waiting_count(&self) -> usize {
        self.counter
            .shortfall()
            .saturating_sub(self.cancelled.load(Ordering::Acquire) as usize)
    }

    fn segment_count(&self) -> usize {
        let guard = epoch::pin();
        let deq = self.deq_head.load(Ordering::Acquire, &guard);
        let enq = self.enq_head.load(Ordering::Acquire, &guard);
        let mut s = if unsafe { deq.deref() }.id <= unsafe { enq.deref() }.id {
            deq
        } else {
            enq
        };
        let mut count = 1;
        loop {
            let next = unsafe { s.deref() }.next.load(Ordering::Acquire, &guard);
            if next.is_null() {
                return count;
            }
            count += 1;
            s = next;
        }
    }
}

impl Drop for SimpleQueue {
    fn drop(&mut self) {
        // Quiescent: waiters borrow the semaphore, so none can be live here,
        // and every fully-exchanged segment behind the heads has already been
        // retired. Free the remaining chain from the trailing head.
        unsafe {
            let guard = epoch::unprotected();
            let deq = self.deq_head.load(Ordering::Relaxed, guard);
            let enq = self.enq_head.load(Ordering::Relaxed, guard);
            let mut s = if deq.deref().id <= enq.deref().id { deq } else { enq };
            while !s.is_null() {
                let next = s.deref().next.load(Ordering::Relaxed, guard);
                debug_assert!(!s.deref().claimed.load(Ordering::Relaxed));
                drop(s.into_owned());
                s = next;
            }
        }
    }
}
