//! Manual-reset event: a broadcast gate that stays open until reset.
//!
//! While set, waits resolve immediately; while clear, waiters park in
//! FIFO order and a single [`set`](ManualResetEvent::set) releases all
//! of them at once. Unlike the lock and semaphore there is nothing to
//! hand back: a grant is just the observation that the gate was open.
//!
//! # Example
//!
//! ```
//! use uplock::ManualResetEvent;
//!
//! let event = ManualResetEvent::new(false);
//! assert!(!event.is_set());
//!
//! event.set().unwrap();
//! assert!(event.is_set());
//!
//! event.reset().unwrap();
//! assert!(!event.is_set());
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use super::wait_queue::WaitQueue;
use super::Wait;
use crate::cancel::CancelToken;
use crate::error::LockError;
use crate::signal::{Outcome, Signal};
use crate::time::{register_wakeup, Deadline, TimerWakeup};

#[derive(Debug)]
struct EventState {
    set: bool,
    disposed: bool,
    queue: WaitQueue<()>,
}

/// A manual-reset event for gating many waiters on one condition.
#[derive(Debug)]
pub struct ManualResetEvent {
    state: Mutex<EventState>,
    /// Lock-free shadow of the set flag for read-heavy checks.
    set_shadow: AtomicBool,
    /// Lock-free shadow of the disposed flag for read-heavy checks.
    disposed_shadow: AtomicBool,
}

impl ManualResetEvent {
    /// Creates an event in the given initial state.
    #[must_use]
    pub const fn new(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(EventState {
                set: initially_set,
                disposed: false,
                queue: WaitQueue::new(),
            }),
            set_shadow: AtomicBool::new(initially_set),
            disposed_shadow: AtomicBool::new(false),
        }
    }

    /// True while the gate is open. Advisory snapshot.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set_shadow.load(Ordering::Acquire)
    }

    /// True once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed_shadow.load(Ordering::Acquire)
    }

    /// Opens the gate, releasing every parked waiter. Idempotent while
    /// set.
    ///
    /// # Errors
    ///
    /// [`LockError::Disposed`] after disposal.
    pub fn set(&self) -> Result<(), LockError> {
        let wakers = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(LockError::Disposed);
            }
            state.set = true;
            self.set_shadow.store(true, Ordering::Release);
            let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
            for node in state.queue.take_all() {
                if let Ok(waker) = node.signal().try_complete(Outcome::Granted) {
                    wakers.extend(waker);
                }
            }
            wakers
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Closes the gate; later waits park until the next
    /// [`set`](Self::set).
    ///
    /// # Errors
    ///
    /// [`LockError::Disposed`] after disposal.
    pub fn reset(&self) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(LockError::Disposed);
        }
        state.set = false;
        self.set_shadow.store(false, Ordering::Release);
        Ok(())
    }

    /// Waits for the gate to open. Resolves `Ok(true)` when set,
    /// `Ok(false)` when the deadline elapses first.
    pub fn wait(&self, wait: Wait) -> WaitFuture<'_> {
        let (deadline, cancel) = wait.into_parts();
        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return WaitFuture::settled(self, Outcome::Cancelled);
        }
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            return WaitFuture::settled(self, Outcome::Disposed);
        }
        if state.set {
            drop(state);
            return WaitFuture::settled(self, Outcome::Granted);
        }
        let signal = Signal::new();
        let node = state.queue.append((), Arc::clone(&signal));
        drop(state);
        WaitFuture {
            event: self,
            signal,
            node: Some(node),
            deadline,
            cancel,
            cancel_reg: None,
            timer: None,
            timer_waker: None,
            consumed: false,
        }
    }

    /// Disposes the event: every parked waiter fails with
    /// [`LockError::Disposed`] and further operations are rejected.
    /// Idempotent.
    pub fn dispose(&self) {
        let wakers = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.disposed_shadow.store(true, Ordering::Release);
            let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
            for node in state.queue.take_all() {
                if let Ok(waker) = node.signal().try_complete(Outcome::Disposed) {
                    wakers.extend(waker);
                }
            }
            wakers
        };
        tracing::debug!(woken = wakers.len(), "manual-reset event disposed");
        for waker in wakers {
            waker.wake();
        }
    }

    #[cfg(test)]
    fn queued_waiters(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Future returned by [`ManualResetEvent::wait`].
///
/// The wait is registered at creation; dropping the future withdraws it.
#[must_use = "dropping a wait withdraws it"]
pub struct WaitFuture<'a> {
    event: &'a ManualResetEvent,
    signal: Arc<Signal>,
    node: Option<u64>,
    deadline: Deadline,
    cancel: Option<CancelToken>,
    cancel_reg: Option<usize>,
    timer: Option<TimerWakeup>,
    timer_waker: Option<Waker>,
    consumed: bool,
}

impl<'a> WaitFuture<'a> {
    fn settled(event: &'a ManualResetEvent, outcome: Outcome) -> Self {
        Self {
            event,
            signal: Signal::pre_completed(outcome),
            node: None,
            deadline: Deadline::Never,
            cancel: None,
            cancel_reg: None,
            timer: None,
            timer_waker: None,
            consumed: false,
        }
    }

    fn resolve(&mut self, outcome: Outcome) -> Outcome {
        let mut state = self.event.state.lock();
        match self.signal.try_complete(outcome) {
            Ok(_own_waker) => {
                if let Some(id) = self.node.take() {
                    state.queue.unlink(id);
                }
                outcome
            }
            Err(winner) => winner,
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Result<bool, LockError> {
        self.consumed = true;
        self.timer = None;
        self.timer_waker = None;
        if let (Some(token), Some(id)) = (&self.cancel, self.cancel_reg.take()) {
            token.deregister(id);
        }
        outcome.into_result()
    }

    fn arm_timer(&mut self, waker: &Waker) {
        if let Deadline::At(at) = self.deadline {
            let stale = self
                .timer_waker
                .as_ref()
                .is_none_or(|registered| !registered.will_wake(waker));
            if stale {
                self.timer = Some(register_wakeup(at, waker.clone()));
                self.timer_waker = Some(waker.clone());
            }
        }
    }
}

impl std::fmt::Debug for WaitFuture<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitFuture")
            .field("terminal", &self.signal.is_terminal())
            .finish_non_exhaustive()
    }
}

impl Future for WaitFuture<'_> {
    type Output = Result<bool, LockError>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(outcome) = this.signal.peek() {
            return Poll::Ready(this.finish(outcome));
        }
        if this.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            let outcome = this.resolve(Outcome::Cancelled);
            return Poll::Ready(this.finish(outcome));
        }
        if this.deadline.is_elapsed() {
            let outcome = this.resolve(Outcome::TimedOut);
            return Poll::Ready(this.finish(outcome));
        }

        if let Some(outcome) = this.signal.register(context.waker()) {
            return Poll::Ready(this.finish(outcome));
        }
        if let Some(token) = &this.cancel {
            match this.cancel_reg {
                Some(id) => token.update(id, context.waker()),
                None => match token.register(context.waker()) {
                    Some(id) => this.cancel_reg = Some(id),
                    None => {
                        let outcome = this.resolve(Outcome::Cancelled);
                        return Poll::Ready(this.finish(outcome));
                    }
                },
            }
        }
        this.arm_timer(context.waker());
        Poll::Pending
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        // Withdraw the parked wait; an observed gate needs no handback.
        let _ = self.resolve(Outcome::Cancelled);
        if let (Some(token), Some(id)) = (&self.cancel, self.cancel_reg.take()) {
            token.deregister(id);
        }
    }
}
