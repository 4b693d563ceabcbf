//! The waiter machinery shared by both semaphore variants and both calling
//! styles.
//!
//! A blocking caller and an async caller run the same protocol: try the
//! counter, install a rented completion cell into the queue, then wait for
//! the cell to resolve. Only the registered continuation differs: a park
//! event for blocking callers, the task waker for async callers. The
//! cancellation handshake is likewise shared: it runs in the waiter's own
//! frame, triggered either by a fired [`CancelToken`] or by dropping an
//! unfinished acquire future.

use crate::cancel::{CancelToken, WatchKey};
use crate::completion;
use crate::error::Cancelled;
use crate::park;
use crate::queue::{CancelOutcome, Install, SemQueue, Slot};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

/// Blocking acquire. Parks the calling thread until a permit is delivered or
/// the token fires.
pub(crate) fn acquire_blocking<Q: SemQueue>(
    queue: &Q,
    token: Option<&CancelToken>,
) -> Result<(), Cancelled> {
    if let Some(token) = token {
        if token.is_cancelled() {
            return Err(Cancelled::new());
        }
    }
    if queue.try_acquire_fast() {
        return Ok(());
    }
    let completion = completion::rent();
    let slot = match queue.install(&completion) {
        Install::Acquired => {
            completion::give_back_unused(completion);
            return Ok(());
        }
        Install::Queued(slot) => slot,
    };
    // The slot keeps its own reference; the pool only takes back uniquely
    // owned cells, so this one must not stay alive across the wait.
    drop(completion);
    wait_blocking(queue, slot, token)
}

fn wait_blocking<Q: SemQueue>(
    queue: &Q,
    slot: Slot,
    token: Option<&CancelToken>,
) -> Result<(), Cancelled> {
    let event = park::thread_event();
    let waker = park::event_waker(&event);
    let watch = token.and_then(|t| t.watch(&waker));
    let mut handshaken = false;
    let result = loop {
        slot.completion.register(&waker);
        match slot.completion.poll_result(slot.version) {
            Ok(Some(result)) => break result,
            Ok(None) => {}
            Err(_) => unreachable!("a queued waiter owns its completion version"),
        }
        if !handshaken {
            if let Some(token) = token {
                if token.is_cancelled() {
                    handshaken = true;
                    if queue.cancel_cell(&slot) == CancelOutcome::Cancelled {
                        slot.completion.resolve(false);
                    }
                    // Either we resolved `false` just now, or a racing
                    // releaser resolves `true` momentarily; re-poll.
                    continue;
                }
            }
        }
        event.wait();
    };
    if let (Some(token), Some(watch)) = (token, watch) {
        token.unwatch(watch);
    }
    finish(queue, slot, result)
}

fn finish<Q: SemQueue>(queue: &Q, slot: Slot, result: bool) -> Result<(), Cancelled> {
    let consumed = slot
        .completion
        .consume(slot.version)
        .expect("the result was just observed");
    debug_assert_eq!(consumed, result);
    queue.release_slot(&slot);
    completion::recycle(slot.completion);
    if result {
        Ok(())
    } else {
        Err(Cancelled::new())
    }
}

#[derive(Debug)]
enum WaitState {
    Init,
    Waiting {
        slot: Slot,
        watch: Option<WatchKey>,
        handshaken: bool,
    },
    Done,
}

enum Step {
    Ready(bool),
    Enqueued(Slot, Option<WatchKey>),
    Finish(bool),
    Again,
    Park,
}

/// The future shared by the async acquire operations; resolves to whether a
/// permit was acquired. Dropping it mid-queue cancels the wait, and a drop
/// that raced a successful hand-off releases the permit back.
#[derive(Debug)]
pub(crate) struct WaitFuture<'a, Q: SemQueue> {
    queue: &'a Q,
    token: Option<&'a CancelToken>,
    state: WaitState,
}

impl<'a, Q: SemQueue> WaitFuture<'a, Q> {
    pub(crate) fn new(queue: &'a Q, token: Option<&'a CancelToken>) -> Self {
        WaitFuture {
            queue,
            token,
            state: WaitState::Init,
        }
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Step {
        match &mut self.state {
            WaitState::Init => {
                if let Some(token) = self.token {
                    if token.is_cancelled() {
                        return Step::Ready(false);
                    }
                }
                if self.queue.try_acquire_fast() {
                    return Step::Ready(true);
                }
                let completion = completion::rent();
                match self.queue.install(&completion) {
                    Install::Acquired => {
                        completion::give_back_unused(completion);
                        Step::Ready(true)
                    }
                    Install::Queued(slot) => {
                        let watch = self.token.and_then(|t| t.watch(cx.waker()));
                        Step::Enqueued(slot, watch)
                    }
                }
            }
            WaitState::Waiting {
                slot,
                watch,
                handshaken,
            } => {
                slot.completion.register(cx.waker());
                match slot.completion.poll_result(slot.version) {
                    Ok(Some(result)) => return Step::Finish(result),
                    Ok(None) => {}
                    Err(_) => unreachable!("a queued waiter owns its completion version"),
                }
                if !*handshaken {
                    if let Some(token) = self.token {
                        if token.is_cancelled() {
                            *handshaken = true;
                            if self.queue.cancel_cell(slot) == CancelOutcome::Cancelled {
                                slot.completion.resolve(false);
                            }
                            return Step::Again;
                        }
                        if let Some(watch) = watch {
                            token.rewatch(watch, cx.waker());
                        }
                    }
                }
                Step::Park
            }
            WaitState::Done => panic!("acquire future polled after completion"),
        }
    }
}

impl<Q: SemQueue> Future for WaitFuture<'_, Q> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        loop {
            match this.step(cx) {
                Step::Ready(result) => {
                    this.state = WaitState::Done;
                    return Poll::Ready(result);
                }
                Step::Enqueued(slot, watch) => {
                    this.state = WaitState::Waiting {
                        slot,
                        watch,
                        handshaken: false,
                    };
                }
                Step::Finish(result) => {
                    let WaitState::Waiting { slot, watch, .. } =
                        std::mem::replace(&mut this.state, WaitState::Done)
                    else {
                        unreachable!()
                    };
                    if let (Some(token), Some(watch)) = (this.token, watch) {
                        token.unwatch(watch);
                    }
                    let consumed = slot
                        .completion
                        .consume(slot.version)
                        .expect("the result was just observed");
                    debug_assert_eq!(consumed, result);
                    this.queue.release_slot(&slot);
                    completion::recycle(slot.completion);
                    return Poll::Ready(result);
                }
                Step::Again => {}
                Step::Park => return Poll::Pending,
            }
        }
    }
}

impl<Q: SemQueue> Drop for WaitFuture<'_, Q> {
    fn drop(&mut self) {
        let WaitState::Waiting {
            slot,
            watch,
            handshaken,
        } = std::mem::replace(&mut self.state, WaitState::Done)
        else {
            return;
        };
        if let (Some(token), Some(watch)) = (self.token, watch) {
            token.unwatch(watch);
        }
        if !handshaken && self.queue.cancel_cell(&slot) == CancelOutcome::Cancelled {
            slot.completion.resolve(false);
        }
        // If the handshake lost (or had already lost), a releaser is in the
        // middle of resolving `true`; that is a bounded wait.
        let result = loop {
            match slot.completion.poll_result(slot.version) {
                Ok(Some(result)) => break result,
                Ok(None) => std::hint::spin_loop(),
                Err(_) => unreachable!("a queued waiter owns its completion version"),
            }
        };
        slot.completion
            .consume(slot.version)
            .expect("the result was just observed");
        self.queue.release_slot(&slot);
        completion::recycle(slot.completion);
        if result {
            // The permit won the race against the drop; nobody owns it now,
            // so conservation demands it go back.
            trace!("dropped acquire returned its permit");
            self.queue.release();
        }
    }
}
