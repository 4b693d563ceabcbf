//! The pruning segment queue: 16-cell doubly-linked segments that are
//! unlinked from the middle of the list once every cell in them has been
//! cancelled.
//!
//! Each segment carries one packed word: the high 16 bits count live
//! references (one per head pointing at the segment, one per queued waiter),
//! the low 16 bits count cancelled cells. A segment whose word reads exactly
//! `SEGMENT_SIZE` is *frozen*: fully cancelled, unreferenced, and (unless it
//! is the tail) eligible for unlinking. Reference acquisition refuses frozen
//! segments, so the frozen state is final.
//!
//! Segments consumed normally are reclaimed the same way as in the simple
//! queue: once every cell has been exchanged by both sides and the reference
//! count has drained.

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

pub(crate) const SEGMENT_SIZE: usize = 16;

const CANCELLED_MASK: u32 = 0xFFFF;
const REF_UNIT: u32 = 1 << 16;
/// Packed state of a frozen segment: zero references, every cell cancelled.
const FROZEN: u32 = SEGMENT_SIZE as u32;

/// One enqueue-side and one dequeue-side exchange per cell.
const ALL_EVENTS: u32 = 2 * SEGMENT_SIZE as u32;

pub(super) struct Segment {
    id: u64,
    next: Atomic<Segment>,
    prev: Atomic<Segment>,
    /// High 16 bits: head/waiter references. Low 16 bits: cancelled cells.
    state: AtomicU32,
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
            prev: Atomic::null(),
            state: AtomicU32::new(refs * REF_UNIT),
            events: AtomicU32::new(0),
            claimed: AtomicBool::new(false),
            cells: std::array::from_fn(|_| AtomicUsize::new(EMPTY)),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        for cell in &mut self.cells {
            let word = *cell.get_mut();
            if word > CANCELED {
                unsafe { drop(completion_from_word(word)) };
            }
        }
    }
}

thread_local! {
    static SPARE: Cell<Option<Box<Segment>>> = const { Cell::new(None) };
}

fn fresh_segment(id: u64, prev: Shared<'_, Segment>) -> Owned<Segment> {
    let owned = match SPARE.with(Cell::take) {
        Some(mut spare) => {
            spare.id = id;
            Owned::from(spare)
        }
        None => Owned::new(Segment::new(id, 0)),
    };
    owned.prev.store(prev, Ordering::Relaxed);
    owned
}

fn stash_spare(spare: Owned<Segment>) {
    spare.prev.store(Shared::null(), Ordering::Relaxed);
    SPARE.with(|slot| slot.set(Some(spare.into_box())));
}

fn is_tail(s: Shared<'_, Segment>, guard: &Guard) -> bool {
    unsafe { s.deref() }.next.load(Ordering::Acquire, guard).is_null()
}

/// Frozen segments are skipped by the relink walks and refused by
/// `try_add_ref`; the tail is never frozen.
fn is_frozen(s: Shared<'_, Segment>, guard: &Guard) -> bool {
    unsafe { s.deref() }.state.load(Ordering::Acquire) == FROZEN && !is_tail(s, guard)
}

/// Take a reference on the segment unless it is frozen.
fn try_add_ref(s: Shared<'_, Segment>, guard: &Guard) -> bool {
    let seg = unsafe { s.deref() };
    let mut state = seg.state.load(Ordering::Acquire);
    loop {
        if state == FROZEN && !is_tail(s, guard) {
            return false;
        }
        match seg.state.compare_exchange(
            state,
            state + REF_UNIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => state = actual,
        }
    }
}

fn release_ref(s: Shared<'_, Segment>, guard: &Guard) {
    let seg = unsafe { s.deref() };
    let state = seg.state.fetch_sub(REF_UNIT, Ordering::AcqRel) - REF_UNIT;
    debug_assert!(state >> 16 != CANCELLED_MASK, "reference underflow");
    if state >> 16 == 0 {
        if state == FROZEN && !is_tail(s, guard) {
            remove(s, guard);
        } else {
            maybe_retire(s, guard);
        }
    }
}

/// Record one cancelled cell; unlinks the segment if that drained it.
fn on_cell_cancelled(s: Shared<'_, Segment>, guard: &Guard) {
    let seg = unsafe { s.deref() };
    let state = seg.state.fetch_add(1, Ordering::AcqRel) + 1;
    debug_assert!(state & CANCELLED_MASK <= SEGMENT_SIZE as u32);
    if state == FROZEN && !is_tail(s, guard) {
        remove(s, guard);
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

fn alive_left<'g>(s: Shared<'g, Segment>, guard: &'g Guard) -> Option<Shared<'g, Segment>> {
    let mut cur = unsafe { s.deref() }.prev.load(Ordering::Acquire, guard);
    loop {
        if cur.is_null() {
            return None;
        }
        if !is_frozen(cur, guard) {
            return Some(cur);
        }
        cur = unsafe { cur.deref() }.prev.load(Ordering::Acquire, guard);
    }
}

fn alive_right<'g>(s: Shared<'g, Segment>, guard: &'g Guard) -> Shared<'g, Segment> {
    // `s` is not the tail and the tail is never frozen, so this terminates.
    let mut cur = unsafe { s.deref() }.next.load(Ordering::Acquire, guard);
    while is_frozen(cur, guard) {
        cur = unsafe { cur.deref() }.next.load(Ordering::Acquire, guard);
    }
    cur
}

/// Unlink a frozen segment by relinking its alive neighbours, retrying while
/// either neighbour was concurrently frozen.
fn remove(s: Shared<'_, Segment>, guard: &Guard) {
    loop {
        let left = alive_left(s, guard);
        let right = alive_right(s, guard);
        unsafe { right.deref() }
            .prev
            .store(left.unwrap_or_else(Shared::null), Ordering::Release);
        if let Some(left) = left {
            unsafe { left.deref() }.next.store(right, Ordering::Release);
        }
        if is_frozen(right, guard) {
            continue;
        }
        if let Some(left) = left {
            if is_frozen(left, guard) {
                continue;
            }
        }
        break;
    }
    let id = unsafe { s.deref() }.id;
    trace!(segment = id, "unlinked drained segment");
    maybe_retire(s, guard);
}

/// Retire a dead segment exactly once: either fully exchanged and
/// unreferenced, or frozen (and by then unlinked).
fn maybe_retire(s: Shared<'_, Segment>, guard: &Guard) {
    let seg = unsafe { s.deref() };
    let state = seg.state.load(Ordering::Acquire);
    if state >> 16 != 0 {
        return;
    }
    let frozen = state == FROZEN && !is_tail(s, guard);
    let exchanged = seg.events.load(Ordering::Acquire) == ALL_EVENTS;
    if !(frozen || exchanged) {
        return;
    }
    if seg.claimed.swap(true, Ordering::AcqRel) {
        return;
    }
    if !frozen {
        // Fully-consumed prefix: sever the successor's back pointer so a
        // relink walk can never reach into retired memory. A frozen
        // segment's neighbours were already rewired by `remove`.
        let next = seg.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            unsafe { next.deref() }.prev.store(Shared::null(), Ordering::Release);
        }
    }
    trace!(segment = seg.id, "retiring segment");
    unsafe { guard.defer_destroy(s) };
}

/// Walk from `start` towards the segment with the given id, appending fresh
/// segments at the tail as needed. May return a segment with a larger id if
/// the target was pruned.
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
        let fresh = fresh_segment(seg.id + 1, current);
        match seg
            .next
            .compare_exchange(Shared::null(), fresh, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => {
                // Gaining a successor may have made a drained tail removable.
                if seg.state.load(Ordering::Acquire) == FROZEN {
                    remove(current, guard);
                }
                current = installed;
            }
            Err(lost) => {
                stash_spare(lost.new);
                current = lost.current;
            }
        }
    }
}

/// Locate the target segment and move `head` up to it, carrying the head's
/// reference along. Retries past segments that froze between location and
/// the reference grab.
fn find_and_advance<'g>(
    head: &Atomic<Segment>,
    start: Shared<'g, Segment>,
    id: u64,
    guard: &'g Guard,
) -> Shared<'g, Segment> {
    let mut from = start;
    loop {
        let s = locate(from, id, guard);
        if move_forward(head, s, guard) {
            return s;
        }
        // `s` froze; it is not the tail, so the chain continues.
        from = unsafe { s.deref() }.next.load(Ordering::Acquire, guard);
    }
}

/// Move `head` forward to `to`, shifting the head's reference. Fails only if
/// `to` is frozen.
fn move_forward<'g>(head: &Atomic<Segment>, to: Shared<'g, Segment>, guard: &'g Guard) -> bool {
    let to_id = unsafe { to.deref() }.id;
    if !try_add_ref(to, guard) {
        return false;
    }
    loop {
        let current = head.load(Ordering::Acquire, guard);
        if unsafe { current.deref() }.id >= to_id {
            release_ref(to, guard);
            return true;
        }
        if head
            .compare_exchange(current, to, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            release_ref(current, guard);
            return true;
        }
    }
}

/// The queue state behind [`PruningSemaphore`](crate::PruningSemaphore).
pub(crate) struct PruningQueue {
    counter: PermitCounter,
    enq_idx: AtomicU64,
    deq_idx: AtomicU64,
    enq_head: Atomic<Segment>,
    deq_head: Atomic<Segment>,
}

impl std::fmt::Debug for PruningQueue {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("PruningQueue")
            .field("counter", &self.counter)
            .field("enq_idx", &self.enq_idx)
            .field("deq_idx", &self.deq_idx)
            .finish_non_exhaustive()
    }
}

impl SemQueue for PruningQueue {
    fn with_permits(permits: usize) -> Self {
        let guard = epoch::pin();
        // Both heads start on the first segment, hence two references.
        let first = Owned::new(Segment::new(0, 2)).into_shared(&guard);
        PruningQueue {
            counter: PermitCounter::new(permits),
            enq_idx: AtomicU64::new(0),
            deq_idx: AtomicU64::new(0),
            enq_head: Atomic::from(first),
            deq_head: Atomic::from(first),
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
            let start = self.deq_head.load(Ordering::Acquire, &guard);
            let index = self.deq_idx.fetch_add(1, Ordering::Relaxed);
            let id = index / SEGMENT_SIZE as u64;
            let s = find_and_advance(&self.deq_head, start, id, &guard);
            let seg = unsafe { s.deref() };
            if seg.id != id {
                // Every slot in the pruned range was cancelled; skip it.
                debug_assert!(seg.id > id);
                let target = seg.id * SEGMENT_SIZE as u64;
                let mut current = self.deq_idx.load(Ordering::Acquire);
                while current < target {
                    match self.deq_idx.compare_exchange(
                        current,
                        target,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
                trace!(index, skipped_to = target, "skipped pruned range");
                continue;
            }
            let cell = &seg.cells[(index % SEGMENT_SIZE as u64) as usize];
            let previous = cell.swap(PERMIT, Ordering::AcqRel);
            record_event(s, &guard);
            match previous {
                EMPTY => {
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
        let s = find_and_advance(&self.enq_head, start, id, &guard);
        let seg = unsafe { s.deref() };
        // The enqueuer's own cell is still EMPTY, so its segment cannot have
        // been drained, let alone pruned.
        debug_assert_eq!(seg.id, id);
        assert!(try_add_ref(s, &guard), "enqueue target cannot be frozen");
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
                unsafe { drop(completion_from_word(word)) };
                release_ref(s, &guard);
                trace!(index, "permit was already deposited");
                Install::Acquired
            }
            Err(word) => unreachable_cell(word),
        }
    }

    fn cancel_cell(&self, slot: &Slot) -> CancelOutcome {
        let guard = epoch::pin();
        let s = Shared::from(slot.segment as *const Segment);
        let seg = unsafe { s.deref() };
        match seg.cells[slot.index].swap(CANCELED, Ordering::AcqRel) {
            word if word == slot.word => {
                unsafe { drop(completion_from_word(word)) };
                trace!(segment = seg.id, index = slot.index, "waiter cancelled");
                // The releaser may already have claimed our dequeue slot;
                // hand the reserved counter slot back, but never mint a
                // permit the queue does not owe.
                self.counter.increment_when_negative();
                on_cell_cancelled(s, &guard);
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
        self.counter.shortfall()
    }

    fn segment_count(&self) -> usize {
        // Counts segments still able to serve hand-offs: drained segments are
        // logically gone even while a head reference pins them in the list.
        let guard = epoch::pin();
        let deq = self.deq_head.load(Ordering::Acquire, &guard);
        let enq = self.enq_head.load(Ordering::Acquire, &guard);
        let mut s = if unsafe { deq.deref() }.id <= unsafe { enq.deref() }.id {
            deq
        } else {
            enq
        };
        let mut count = 0;
        loop {
            let seg = unsafe { s.deref() };
            let cancelled = seg.state.load(Ordering::Acquire) & CANCELLED_MASK;
            let next = seg.next.load(Ordering::Acquire, &guard);
            if !(cancelled == SEGMENT_SIZE as u32 && !next.is_null()) {
                count += 1;
            }
            if next.is_null() {
                return count;
            }
            s = next;
        }
    }
}

impl Drop for PruningQueue {
    fn drop(&mut self) {
        // Quiescent: unlinked segments were already retired, fully-exchanged
        // segments were retired when their references drained, so the chain
        // from the trailing head is exactly what remains.
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
