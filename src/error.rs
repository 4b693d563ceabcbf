use std::fmt;

/// Error returned from the cancellable `acquire` operations.
///
/// An acquire can only fail if the caller's [`CancelToken`] fired before a
/// permit was delivered. The `try_acquire` family reports the same outcome
/// as `false` instead of an error.
///
/// [`CancelToken`]: crate::CancelToken
#[derive(Debug, PartialEq, Eq)]
pub struct Cancelled(());

impl Cancelled {
    pub(crate) fn new() -> Cancelled {
        Cancelled(())
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "acquire cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// A completion cell was used with a stale version, or its result was
/// consumed twice. Always a bug in the waiter machinery, never surfaced to
/// callers.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct InvalidState;
