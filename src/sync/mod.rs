//! Synchronization primitives with handoff-style grants.
//!
//! Every primitive in this module follows the same protocol:
//!
//! - **Acquire** evaluates its grant predicate under the primitive's
//!   monitor. If the wait queue is empty and the predicate holds, the
//!   request is granted on the spot and the returned future is already
//!   resolved. Otherwise the request joins a strict-FIFO wait queue
//!   *immediately* — dropping the future withdraws it.
//! - **Release** is synchronous and non-blocking: it flips state under
//!   the monitor, completes the signals of waiters whose turn has come,
//!   and invokes their wakers only after the monitor is released.
//!
//! Fairness is strict FIFO: an arriving request never overtakes a queued
//! request of an incompatible mode, so writers cannot be starved by a
//! stream of readers.
//!
//! # Primitives
//!
//! - [`ReaderWriterLock`]: shared/exclusive lock with an upgradeable
//!   read mode
//! - [`Semaphore`]: counting semaphore
//! - [`ManualResetEvent`]: broadcast gate that stays open until reset
//!
//! # Cancel safety
//!
//! All waits accept a [`Wait`] spec carrying an optional deadline and
//! cancellation token. A waiter that times out, is cancelled, or is
//! dropped removes itself from the queue; a grant that was committed but
//! never observed is handed back automatically.

mod event;
mod rwlock;
mod semaphore;
mod wait_queue;

pub use event::{ManualResetEvent, WaitFuture};
pub use rwlock::{AcquireFuture, ReaderWriterLock, StrictFuture};
pub use semaphore::{PermitFuture, Semaphore};

use crate::cancel::CancelToken;
use crate::time::Deadline;
use std::time::Duration;

/// How long to wait and on whose behalf: the two orthogonal knobs of an
/// acquisition, both off by default.
///
/// # Example
///
/// ```
/// use uplock::{CancelSource, Wait};
/// use std::time::Duration;
///
/// let source = CancelSource::new();
///
/// let _forever = Wait::FOREVER;
/// let _bounded = Wait::timeout(Duration::from_millis(50));
/// let _revocable = Wait::FOREVER.cancelled_by(&source.token());
/// let _both = Wait::timeout(Duration::from_millis(50)).cancelled_by(&source.token());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Wait {
    deadline: Deadline,
    cancel: Option<CancelToken>,
}

impl Wait {
    /// Wait until granted, cancelled, or the primitive is disposed.
    pub const FOREVER: Self = Self {
        deadline: Deadline::Never,
        cancel: None,
    };

    /// Gives up `timeout` from now; the wait then resolves `Ok(false)`.
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            deadline: Deadline::after(timeout),
            cancel: None,
        }
    }

    /// Waits until an explicit [`Deadline`].
    #[must_use]
    pub const fn until(deadline: Deadline) -> Self {
        Self {
            deadline,
            cancel: None,
        }
    }

    /// Attaches a cancellation token; tripping it fails the wait with
    /// [`LockError::Cancelled`](crate::LockError::Cancelled).
    #[must_use]
    pub fn cancelled_by(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    pub(crate) fn into_parts(self) -> (Deadline, Option<CancelToken>) {
        (self.deadline, self.cancel)
    }
}

impl From<Duration> for Wait {
    fn from(timeout: Duration) -> Self {
        Self::timeout(timeout)
    }
}

impl From<Deadline> for Wait {
    fn from(deadline: Deadline) -> Self {
        Self::until(deadline)
    }
}
