#![deny(warnings, missing_debug_implementations, missing_docs)]

//! Segment-queue counting semaphores for mixed blocking and async workloads.
//!
//! Stock semaphore implementations guard their waiter queue with a mutex, so
//! under heavy contention every acquirer and releaser serialises on the same
//! cache line. The semaphores in this crate instead pair a single atomic
//! permit counter with a lock-free queue of fixed-size cell segments: the
//! uncontended path is one atomic instruction, a contended hand-off is an
//! atomic exchange on the waiter's private cell, and the steady state
//! allocates nothing, because the waiter's completion cell, its park event,
//! and the queue segments are all pooled.
//!
//! Both OS threads and cooperatively-scheduled tasks can wait on the same
//! semaphore at the same time; permits are delivered in strict FIFO order
//! across both kinds of waiter.
//!
//! Two variants are provided:
//!
//! - [`Semaphore`]: 256-cell segments, the default choice.
//! - [`PruningSemaphore`]: 16-cell segments that are physically unlinked
//!   once fully cancelled, for cancellation-heavy workloads.
//!
//! Cancellation is a first-class signal: pass a [`CancelToken`] to any
//! acquire operation and fire it from anywhere, or (for async callers)
//! just drop the acquire future. Either way the waiter promptly leaves the
//! queue, and a permit that races the cancellation is never lost: it is
//! delivered to the cancelling waiter or handed to the next one in line.
//!
//! # Example
//!
//! ```
//! use segsem::{CancelToken, Semaphore};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let semaphore = Arc::new(Semaphore::new(0));
//!
//! // A blocking waiter on one thread...
//! let waiter = {
//!     let semaphore = Arc::clone(&semaphore);
//!     thread::spawn(move || semaphore.acquire(None))
//! };
//!
//! // ...resumed by a release from another.
//! semaphore.release();
//! waiter.join().unwrap().unwrap();
//!
//! // A cancelled waiter reports `false` instead.
//! let token = CancelToken::new();
//! token.cancel();
//! assert!(!semaphore.try_acquire(Some(&token)));
//! ```

mod cancel;
mod completion;
mod counter;
mod error;
mod park;
mod queue;
mod waiter;

pub mod pruning;
pub mod semaphore;

pub use cancel::CancelToken;
pub use error::Cancelled;
pub use pruning::PruningSemaphore;
pub use semaphore::Semaphore;
