//! Counting semaphore for limiting concurrent access.
//!
//! The semaphore follows the module's grant-handoff protocol: a releaser
//! (or a withdrawing waiter) commits grants to the FIFO queue's eligible
//! prefix under the monitor, and the waiters' futures observe them. A
//! waiter asking for more permits than are free blocks every waiter
//! behind it, even ones whose smaller request would fit — strict FIFO,
//! no queue jumping.
//!
//! Permit accounting is explicit: callers pair every grant of `count`
//! permits with `release(count)`. Releasing more than was ever acquired
//! is not detected (the semaphore tracks counts, not owners) and simply
//! raises capacity, saturating at `usize::MAX`.
//!
//! # Example
//!
//! ```
//! use uplock::{Semaphore, Wait};
//!
//! let semaphore = Semaphore::new(2);
//! assert_eq!(semaphore.try_acquire(2), Ok(true));
//! assert_eq!(semaphore.try_acquire(1), Ok(false));
//!
//! semaphore.release(2).unwrap();
//! assert_eq!(semaphore.available_permits(), 2);
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use super::wait_queue::WaitQueue;
use super::Wait;
use crate::cancel::CancelToken;
use crate::error::LockError;
use crate::signal::{Outcome, Signal};
use crate::time::{register_wakeup, Deadline, TimerWakeup};

#[derive(Debug)]
struct SemaphoreState {
    permits: usize,
    disposed: bool,
    /// Waiters tagged with their requested permit count.
    queue: WaitQueue<usize>,
}

impl SemaphoreState {
    /// Grants the queue prefix whose requests fit the free permits.
    fn drain(&mut self, wakers: &mut SmallVec<[Waker; 4]>) {
        while let Some(head) = self.queue.peek_head() {
            let count = *head.tag();
            if count > self.permits {
                break;
            }
            let Some(node) = self.queue.pop_head() else {
                break;
            };
            if let Ok(waker) = node.signal().try_complete(Outcome::Granted) {
                self.permits -= count;
                wakers.extend(waker);
            }
        }
    }
}

/// A counting semaphore with FIFO fairness and handoff-style grants.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    /// Lock-free shadow of available permits for read-heavy diagnostics.
    permits_shadow: AtomicUsize,
    /// Lock-free shadow of the disposed flag for read-heavy checks.
    disposed_shadow: AtomicBool,
    /// Maximum permits (initial count).
    max_permits: usize,
}

impl Semaphore {
    /// Creates a new semaphore with the given number of permits.
    #[must_use]
    pub const fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits,
                disposed: false,
                queue: WaitQueue::new(),
            }),
            permits_shadow: AtomicUsize::new(permits),
            disposed_shadow: AtomicBool::new(false),
            max_permits: permits,
        }
    }

    /// Returns the number of currently available permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        // Relaxed: advisory hint only. Stale reads are benign — the real
        // count is protected by the monitor.
        self.permits_shadow.load(Ordering::Relaxed)
    }

    /// Returns the maximum number of permits (initial count).
    #[must_use]
    pub const fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// True once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed_shadow.load(Ordering::Acquire)
    }

    /// Requests `count` permits.
    ///
    /// Granted immediately when nobody is queued and enough permits are
    /// free; otherwise joins the FIFO queue. Resolves `Ok(true)` on
    /// grant, `Ok(false)` when the deadline elapses first.
    ///
    /// # Panics
    ///
    /// Panics when `count` is zero.
    pub fn acquire(&self, count: usize, wait: Wait) -> PermitFuture<'_> {
        assert!(count > 0, "cannot acquire 0 permits");
        let (deadline, cancel) = wait.into_parts();
        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return PermitFuture::settled(self, count, Outcome::Cancelled);
        }
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            return PermitFuture::settled(self, count, Outcome::Disposed);
        }
        if state.queue.is_empty() && state.permits >= count {
            state.permits -= count;
            self.permits_shadow.store(state.permits, Ordering::Relaxed);
            drop(state);
            return PermitFuture::settled(self, count, Outcome::Granted);
        }
        let signal = Signal::new();
        let node = state.queue.append(count, Arc::clone(&signal));
        drop(state);
        PermitFuture {
            semaphore: self,
            count,
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

    /// Grants `count` permits without waiting: `Ok(true)` on success,
    /// `Ok(false)` when the request would have queued.
    ///
    /// # Panics
    ///
    /// Panics when `count` is zero.
    pub fn try_acquire(&self, count: usize) -> Result<bool, LockError> {
        assert!(count > 0, "cannot acquire 0 permits");
        let mut state = self.state.lock();
        if state.disposed {
            return Err(LockError::Disposed);
        }
        if state.queue.is_empty() && state.permits >= count {
            state.permits -= count;
            self.permits_shadow.store(state.permits, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Returns `count` permits and grants the now-eligible queue prefix.
    /// Saturates at `usize::MAX`.
    ///
    /// # Errors
    ///
    /// [`LockError::Disposed`] after disposal.
    pub fn release(&self, count: usize) -> Result<(), LockError> {
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(LockError::Disposed);
            }
            state.permits = state.permits.saturating_add(count);
            state.drain(&mut wakers);
            self.permits_shadow.store(state.permits, Ordering::Relaxed);
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Disposes the semaphore: every pending waiter fails with
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
        tracing::debug!(woken = wakers.len(), "semaphore disposed");
        for waker in wakers {
            waker.wake();
        }
    }

    /// Hands permits back without the disposal check, for futures
    /// undoing a grant that was never observed.
    fn restore(&self, count: usize) {
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.permits = state.permits.saturating_add(count);
            state.drain(&mut wakers);
            self.permits_shadow.store(state.permits, Ordering::Relaxed);
        }
        for waker in wakers {
            waker.wake();
        }
    }

    #[cfg(test)]
    fn queued_waiters(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Future returned by [`Semaphore::acquire`].
///
/// The request queues at creation; dropping the future withdraws it,
/// and hands back granted permits that were never observed.
#[must_use = "dropping an acquisition withdraws the request"]
pub struct PermitFuture<'a> {
    semaphore: &'a Semaphore,
    count: usize,
    signal: Arc<Signal>,
    node: Option<u64>,
    deadline: Deadline,
    cancel: Option<CancelToken>,
    cancel_reg: Option<usize>,
    timer: Option<TimerWakeup>,
    timer_waker: Option<Waker>,
    consumed: bool,
}

impl<'a> PermitFuture<'a> {
    fn settled(semaphore: &'a Semaphore, count: usize, outcome: Outcome) -> Self {
        Self {
            semaphore,
            count,
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
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        let resolved = {
            let mut state = self.semaphore.state.lock();
            match self.signal.try_complete(outcome) {
                Ok(_own_waker) => {
                    if let Some(id) = self.node.take() {
                        state.queue.unlink(id);
                    }
                    // Removing a large request can make smaller ones
                    // behind it eligible.
                    if !state.disposed {
                        state.drain(&mut wakers);
                        self.semaphore
                            .permits_shadow
                            .store(state.permits, Ordering::Relaxed);
                    }
                    outcome
                }
                Err(winner) => winner,
            }
        };
        for waker in wakers {
            waker.wake();
        }
        resolved
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

impl std::fmt::Debug for PermitFuture<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitFuture")
            .field("count", &self.count)
            .field("terminal", &self.signal.is_terminal())
            .finish_non_exhaustive()
    }
}

impl Future for PermitFuture<'_> {
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

impl Drop for PermitFuture<'_> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        enum Undo {
            Withdrawn,
            HandBack,
            Nothing,
        }
        let undo = {
            let mut state = self.semaphore.state.lock();
            match self.signal.try_complete(Outcome::Cancelled) {
                Ok(_own_waker) => {
                    if let Some(id) = self.node.take() {
                        state.queue.unlink(id);
                    }
                    Undo::Withdrawn
                }
                Err(Outcome::Granted) => Undo::HandBack,
                Err(_) => Undo::Nothing,
            }
        };
        if let (Some(token), Some(id)) = (&self.cancel, self.cancel_reg.take()) {
            token.deregister(id);
        }
        match undo {
            // A withdrawn request can expose eligible successors.
            Undo::Withdrawn => self.semaphore.restore(0),
            // The grant was never observed: hand the permits back.
            Undo::HandBack => self.semaphore.restore(self.count),
            Undo::Nothing => {}
        }
    }
}
