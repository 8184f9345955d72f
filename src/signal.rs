//! One-shot completion signal backing every pending acquisition.
//!
//! A [`Signal`] is the handoff point between a releaser and a waiter: the
//! releaser (or a timeout, a cancellation, or disposal) commits exactly one
//! terminal [`Outcome`] while holding the owning primitive's monitor, and
//! the waiter's future observes it from `poll`. Completion is
//! multi-producer / single-consumer: the four resolution paths race and
//! exactly one wins.
//!
//! The committed outcome *happens-before* the awaiting caller observes the
//! grant; the signal's own mutex provides the fence.
//!
//! # Waking discipline
//!
//! [`Signal::try_complete`] never invokes the registered waker. It hands
//! the waker back to the completing caller, who invokes it only after
//! dropping the monitor. Waking under the monitor would let an awoken
//! continuation reenter the primitive while its state is mid-transition.

use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Waker;

use crate::error::LockError;

/// Terminal state of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The lock (or permit, or event) was granted.
    Granted,
    /// The deadline elapsed first.
    TimedOut,
    /// The cancellation token tripped first.
    Cancelled,
    /// The primitive was disposed while the wait was pending.
    Disposed,
}

impl Outcome {
    /// Maps a terminal outcome onto the caller-visible acquisition result.
    pub(crate) const fn into_result(self) -> Result<bool, LockError> {
        match self {
            Self::Granted => Ok(true),
            Self::TimedOut => Ok(false),
            Self::Cancelled => Err(LockError::Cancelled),
            Self::Disposed => Err(LockError::Disposed),
        }
    }
}

#[derive(Debug)]
struct SignalInner {
    outcome: Option<Outcome>,
    waker: Option<Waker>,
}

/// A one-shot deferred completion carrying an [`Outcome`].
#[derive(Debug)]
pub(crate) struct Signal {
    inner: Mutex<SignalInner>,
}

impl Signal {
    /// Creates a pending signal.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SignalInner {
                outcome: None,
                waker: None,
            }),
        })
    }

    /// Creates a signal that is already terminal.
    ///
    /// Used by the grant-at-acquire-time and disposed-at-acquire-time
    /// fast paths: when the predicate holds at acquire time, the caller
    /// receives a signal that resolves without any scheduling.
    pub(crate) fn pre_completed(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SignalInner {
                outcome: Some(outcome),
                waker: None,
            }),
        })
    }

    /// Attempts to commit `outcome` as the terminal state.
    ///
    /// On the winning path returns the registered waker (if any); the
    /// caller must invoke it only after releasing its monitor. On the
    /// losing path returns the outcome that won.
    pub(crate) fn try_complete(&self, outcome: Outcome) -> Result<Option<Waker>, Outcome> {
        let mut inner = self.inner.lock();
        match inner.outcome {
            Some(winner) => Err(winner),
            None => {
                inner.outcome = Some(outcome);
                Ok(inner.waker.take())
            }
        }
    }

    /// Returns the terminal outcome, if one has been committed.
    pub(crate) fn peek(&self) -> Option<Outcome> {
        self.inner.lock().outcome
    }

    /// Returns true once a terminal outcome has been committed.
    pub(crate) fn is_terminal(&self) -> bool {
        self.peek().is_some()
    }

    /// Registers `waker` to be invoked on completion.
    ///
    /// Returns the terminal outcome instead when the signal completed
    /// concurrently, closing the race between the caller's pending check
    /// and its registration: the completer that found no waker cannot
    /// wake us, so we must observe the outcome here.
    pub(crate) fn register(&self, waker: &Waker) -> Option<Outcome> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.outcome {
            return Some(outcome);
        }
        match &mut inner.waker {
            Some(existing) if existing.will_wake(waker) => {}
            slot => *slot = Some(waker.clone()),
        }
        None
    }
}
