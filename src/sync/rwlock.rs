//! Asynchronous reader/writer lock with an upgradeable read mode.
//!
//! The lock admits many readers or a single writer, plus at most one
//! *upgradeable* reader that reserves the exclusive right to acquire the
//! write mode in place without releasing first. Acquisition never parks
//! an OS thread: callers receive a future that resolves when the grant
//! commits, the deadline elapses, or the wait is cancelled. Release is a
//! synchronous state transition that dispatches queued waiters.
//!
//! # Fairness
//!
//! The wait queue is strict FIFO across all three modes. A request is
//! granted at acquire time only when the queue is empty and its
//! predicate holds; once anyone is queued, new arrivals queue behind
//! them even if their predicate would hold. In particular a reader
//! arriving while a writer waits goes behind that writer, so writers
//! cannot be starved by an overlapping stream of readers.
//!
//! | Scenario                    | Behavior                                   |
//! |-----------------------------|--------------------------------------------|
//! | Idle lock, reader arrives   | Granted immediately                        |
//! | Readers active, writer next | Writer queues until all readers release    |
//! | Writer queued, reader next  | Reader queues behind the writer            |
//! | Writer releases             | Head writer handed off, else readers drain |
//!
//! # Grant accounting
//!
//! The lock tracks counts, not owners. Callers pair every grant with the
//! release method of the same mode; releasing a mode that is not held
//! fails with [`LockError::NotHeld`] and changes nothing. Acquisition is
//! not re-entrant — a holder that requests an incompatible second grant
//! on the same lock deadlocks against itself.
//!
//! # Example
//!
//! ```
//! use uplock::{ReaderWriterLock, Wait};
//!
//! let lock = ReaderWriterLock::new();
//!
//! // An idle lock grants readers synchronously.
//! assert_eq!(lock.try_read(), Ok(true));
//! assert_eq!(lock.read_count(), 1);
//!
//! // A writer must wait for the reader...
//! assert_eq!(lock.try_write(), Ok(false));
//!
//! // ...and gets through once it releases.
//! lock.release_read().unwrap();
//! assert_eq!(lock.try_write(), Ok(true));
//! lock.release_write().unwrap();
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

/// The three acquisition modes, used as the wait-queue tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Read,
    UpgradeableRead,
    Write,
}

#[derive(Debug)]
struct LockState {
    /// Granted read slots; an upgradeable reader counts as one.
    readers: usize,
    writer_held: bool,
    /// An upgradeable reader is present, or has upgraded in place.
    upgradeable: bool,
    disposed: bool,
    queue: WaitQueue<WaitKind>,
}

impl LockState {
    const fn new() -> Self {
        Self {
            readers: 0,
            writer_held: false,
            upgradeable: false,
            disposed: false,
            queue: WaitQueue::new(),
        }
    }

    fn can_grant(&self, kind: WaitKind) -> bool {
        match kind {
            WaitKind::Read => !self.writer_held,
            WaitKind::UpgradeableRead => !self.writer_held && !self.upgradeable,
            WaitKind::Write => {
                // The readers == 1 case is the in-place upgrade: the sole
                // reader is the upgradeable one, and its reader slot is
                // kept for symmetric release accounting.
                !self.writer_held
                    && (self.readers == 0 || (self.readers == 1 && self.upgradeable))
            }
        }
    }

    fn apply_grant(&mut self, kind: WaitKind) {
        match kind {
            WaitKind::Read => self.readers += 1,
            WaitKind::UpgradeableRead => {
                self.readers += 1;
                self.upgradeable = true;
            }
            WaitKind::Write => self.writer_held = true,
        }
    }

    /// Hands the lock to the head waiter if it is a writer. Caller has
    /// established that no readers remain.
    fn handoff_to_head_writer(&mut self, wakers: &mut SmallVec<[Waker; 4]>) {
        loop {
            let head_is_writer = self
                .queue
                .peek_head()
                .is_some_and(|node| matches!(node.tag(), &WaitKind::Write));
            if !head_is_writer {
                return;
            }
            let Some(node) = self.queue.pop_head() else {
                return;
            };
            if let Ok(waker) = node.signal().try_complete(Outcome::Granted) {
                self.writer_held = true;
                wakers.extend(waker);
                return;
            }
            // Signal already terminal: the node is dead, try the next.
        }
    }

    /// Grants the reader prefix of the queue, stopping at the first
    /// writer. A second upgradeable reader is skipped in place: it keeps
    /// its queue position and becomes the next upgradeable candidate
    /// once the current one exits.
    fn drain_readers(&mut self, wakers: &mut SmallVec<[Waker; 4]>) {
        let mut index = 0;
        while let Some(node) = self.queue.get(index) {
            match *node.tag() {
                WaitKind::Write => break,
                WaitKind::UpgradeableRead if self.upgradeable => {
                    index += 1;
                }
                kind => {
                    if let Some(node) = self.queue.remove_at(index) {
                        if let Ok(waker) = node.signal().try_complete(Outcome::Granted) {
                            self.apply_grant(kind);
                            wakers.extend(waker);
                        }
                    }
                }
            }
        }
    }

    /// Re-examines the queue after a waiter left it without a grant.
    /// Removing a node can expose grantable successors: a queued reader
    /// behind a withdrawn writer, or a writer that is now at the head.
    fn dispatch_unblocked(&mut self, wakers: &mut SmallVec<[Waker; 4]>) {
        if self.writer_held || self.disposed {
            return;
        }
        if self.readers == 0 {
            self.handoff_to_head_writer(wakers);
            if self.writer_held {
                return;
            }
        }
        self.drain_readers(wakers);
    }

    fn release_read(&mut self, wakers: &mut SmallVec<[Waker; 4]>) -> Result<(), LockError> {
        if self.disposed {
            return Err(LockError::Disposed);
        }
        // An upgradeable reader must exit through its own release; the
        // plain-read door refuses it.
        if self.writer_held || self.readers == 0 || (self.readers == 1 && self.upgradeable) {
            return Err(LockError::NotHeld);
        }
        self.readers -= 1;
        if self.readers == 0 {
            self.handoff_to_head_writer(wakers);
        }
        // No reader drain here: any queued reader sits behind a queued
        // writer, whose predicate still failed while readers > 0.
        Ok(())
    }

    fn release_write(&mut self, wakers: &mut SmallVec<[Waker; 4]>) -> Result<(), LockError> {
        if self.disposed {
            return Err(LockError::Disposed);
        }
        if !self.writer_held {
            return Err(LockError::NotHeld);
        }
        self.writer_held = false;
        if self.readers == 0 {
            // Direct writer-to-writer handoff: a writer at the head is
            // served before any readers behind it, preserving strict
            // FIFO across the read/write boundary.
            self.handoff_to_head_writer(wakers);
        }
        if !self.writer_held {
            self.drain_readers(wakers);
        }
        Ok(())
    }

    fn release_upgradeable_read(
        &mut self,
        wakers: &mut SmallVec<[Waker; 4]>,
    ) -> Result<(), LockError> {
        if self.disposed {
            return Err(LockError::Disposed);
        }
        if self.writer_held || !self.upgradeable || self.readers == 0 {
            return Err(LockError::NotHeld);
        }
        self.upgradeable = false;
        self.readers -= 1;
        if self.readers == 0 {
            self.handoff_to_head_writer(wakers);
        }
        if !self.writer_held {
            self.drain_readers(wakers);
        }
        Ok(())
    }
}

/// An asynchronous reader/writer lock with an upgradeable read mode and
/// strict-FIFO fairness.
///
/// See the [module documentation](self) for the grant protocol. The lock
/// carries no data; it is a pure synchronization primitive with explicit
/// paired release methods.
#[derive(Debug)]
pub struct ReaderWriterLock {
    state: Mutex<LockState>,
    /// Lock-free shadow of the disposed flag for read-heavy checks.
    disposed_shadow: AtomicBool,
}

impl ReaderWriterLock {
    /// Creates an idle lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(LockState::new()),
            disposed_shadow: AtomicBool::new(false),
        }
    }

    /// Requests a shared read grant.
    ///
    /// Granted immediately when no writer holds the lock and nobody is
    /// queued; otherwise the request joins the wait queue at the tail.
    /// The returned future resolves `Ok(true)` on grant, `Ok(false)`
    /// when the deadline elapses first.
    pub fn read(&self, wait: Wait) -> AcquireFuture<'_> {
        self.acquire(WaitKind::Read, wait)
    }

    /// Requests an upgradeable read grant.
    ///
    /// At most one upgradeable reader exists at a time; a second request
    /// parks until the current one exits, even while plain readers come
    /// and go.
    pub fn upgradeable_read(&self, wait: Wait) -> AcquireFuture<'_> {
        self.acquire(WaitKind::UpgradeableRead, wait)
    }

    /// Requests an exclusive write grant.
    ///
    /// Granted immediately on an idle, unqueued lock — or, in place,
    /// when the caller is the sole reader in upgradeable mode. Release
    /// after an in-place upgrade is in reverse order:
    /// [`release_write`](Self::release_write) first, then
    /// [`release_upgradeable_read`](Self::release_upgradeable_read).
    pub fn write(&self, wait: Wait) -> AcquireFuture<'_> {
        self.acquire(WaitKind::Write, wait)
    }

    /// Read grant without waiting: `Ok(true)` and the grant, or
    /// `Ok(false)` when it would have queued.
    pub fn try_read(&self) -> Result<bool, LockError> {
        self.try_acquire(WaitKind::Read)
    }

    /// Upgradeable read grant without waiting.
    pub fn try_upgradeable_read(&self) -> Result<bool, LockError> {
        self.try_acquire(WaitKind::UpgradeableRead)
    }

    /// Write grant without waiting. Never jumps a non-empty queue, so a
    /// grantable lock still reports `Ok(false)` while waiters are ahead.
    pub fn try_write(&self) -> Result<bool, LockError> {
        self.try_acquire(WaitKind::Write)
    }

    /// Releases a plain read grant.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] when no plain read grant is outstanding —
    /// including when the only reader is the upgradeable one, which must
    /// use [`release_upgradeable_read`](Self::release_upgradeable_read).
    pub fn release_read(&self) -> Result<(), LockError> {
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        let result = self.state.lock().release_read(&mut wakers);
        for waker in wakers {
            waker.wake();
        }
        result
    }

    /// Releases the write grant, handing the lock to the head writer or
    /// draining the reader prefix of the queue.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] when no writer holds the lock.
    pub fn release_write(&self) -> Result<(), LockError> {
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        let result = self.state.lock().release_write(&mut wakers);
        for waker in wakers {
            waker.wake();
        }
        result
    }

    /// Releases the upgradeable read grant.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] when upgradeable mode is not held — in
    /// particular while an in-place upgrade is still outstanding
    /// (release the write first).
    pub fn release_upgradeable_read(&self) -> Result<(), LockError> {
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        let result = self.state.lock().release_upgradeable_read(&mut wakers);
        for waker in wakers {
            waker.wake();
        }
        result
    }

    /// Number of granted read slots. Advisory: the value may be stale
    /// the instant after observation.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.state.lock().readers
    }

    /// True while at least one read grant (of either flavor) is out.
    #[must_use]
    pub fn is_read_held(&self) -> bool {
        self.state.lock().readers > 0
    }

    /// True while the write grant is out.
    #[must_use]
    pub fn is_write_held(&self) -> bool {
        self.state.lock().writer_held
    }

    /// True while an upgradeable reader holds the lock and has not
    /// upgraded to writer.
    #[must_use]
    pub fn is_upgradeable_read_held(&self) -> bool {
        let state = self.state.lock();
        state.upgradeable && !state.writer_held
    }

    /// True once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed_shadow.load(Ordering::Acquire)
    }

    /// Disposes the lock: every pending waiter fails with
    /// [`LockError::Disposed`], and all further operations are
    /// rejected. Idempotent.
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
        tracing::debug!(woken = wakers.len(), "reader/writer lock disposed");
        for waker in wakers {
            waker.wake();
        }
    }

    fn try_acquire(&self, kind: WaitKind) -> Result<bool, LockError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(LockError::Disposed);
        }
        if state.queue.is_empty() && state.can_grant(kind) {
            state.apply_grant(kind);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn acquire(&self, kind: WaitKind, wait: Wait) -> AcquireFuture<'_> {
        let (deadline, cancel) = wait.into_parts();
        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            // Tripped before the request: fail without touching the lock.
            return AcquireFuture::settled(self, kind, Outcome::Cancelled);
        }
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            return AcquireFuture::settled(self, kind, Outcome::Disposed);
        }
        if state.queue.is_empty() && state.can_grant(kind) {
            state.apply_grant(kind);
            drop(state);
            return AcquireFuture::settled(self, kind, Outcome::Granted);
        }
        let signal = Signal::new();
        let node = state.queue.append(kind, Arc::clone(&signal));
        drop(state);
        AcquireFuture {
            lock: self,
            kind,
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

    #[cfg(test)]
    fn queued_waiters(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by the three acquisition methods.
///
/// The request is registered *at creation*, not at first poll: grants,
/// queue position, and fairness are decided when the acquire method
/// runs. The future only observes the outcome. Dropping it withdraws a
/// pending request, and hands back a grant that committed but was never
/// observed.
#[must_use = "dropping an acquisition withdraws the request"]
pub struct AcquireFuture<'a> {
    lock: &'a ReaderWriterLock,
    kind: WaitKind,
    signal: Arc<Signal>,
    /// Queue node id; `None` when the request never queued.
    node: Option<u64>,
    deadline: Deadline,
    cancel: Option<CancelToken>,
    cancel_reg: Option<usize>,
    timer: Option<TimerWakeup>,
    timer_waker: Option<Waker>,
    consumed: bool,
}

impl<'a> AcquireFuture<'a> {
    fn settled(lock: &'a ReaderWriterLock, kind: WaitKind, outcome: Outcome) -> Self {
        Self {
            lock,
            kind,
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

    /// Converts `Ok(false)` (deadline elapsed) into
    /// [`LockError::TimedOut`] for callers that treat a missed deadline
    /// as a hard failure.
    pub fn strict(self) -> StrictFuture<'a> {
        StrictFuture { inner: self }
    }

    /// Commits `outcome` unless the grant (or disposal) got there first;
    /// either way returns the outcome that won. On the winning path the
    /// node is unlinked and newly grantable successors are dispatched.
    fn resolve(&mut self, outcome: Outcome) -> Outcome {
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        let resolved = {
            let mut state = self.lock.state.lock();
            match self.signal.try_complete(outcome) {
                Ok(_own_waker) => {
                    if let Some(id) = self.node.take() {
                        state.queue.unlink(id);
                    }
                    state.dispatch_unblocked(&mut wakers);
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

    /// Marks the wait observed and tears down timeout/cancel listeners.
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
                // Dropping the previous registration disarms it.
                self.timer = Some(register_wakeup(at, waker.clone()));
                self.timer_waker = Some(waker.clone());
            }
        }
    }
}

impl std::fmt::Debug for AcquireFuture<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireFuture")
            .field("kind", &self.kind)
            .field("terminal", &self.signal.is_terminal())
            .finish_non_exhaustive()
    }
}

impl Future for AcquireFuture<'_> {
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

        // Registration closes the completion race: a completer that saw
        // no waker cannot wake us, so the signal reports the outcome
        // here instead of parking us.
        if let Some(outcome) = this.signal.register(context.waker()) {
            return Poll::Ready(this.finish(outcome));
        }
        if let Some(token) = &this.cancel {
            match this.cancel_reg {
                Some(id) => token.update(id, context.waker()),
                None => match token.register(context.waker()) {
                    Some(id) => this.cancel_reg = Some(id),
                    None => {
                        // Tripped between the check above and now.
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

impl Drop for AcquireFuture<'_> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        let mut wakers: SmallVec<[Waker; 4]> = SmallVec::new();
        {
            let mut state = self.lock.state.lock();
            match self.signal.try_complete(Outcome::Cancelled) {
                Ok(_own_waker) => {
                    if let Some(id) = self.node.take() {
                        state.queue.unlink(id);
                    }
                    state.dispatch_unblocked(&mut wakers);
                }
                // The grant committed but was never observed: hand it
                // back so an abandoned future cannot strand the lock.
                Err(Outcome::Granted) => {
                    let _ = match self.kind {
                        WaitKind::Read => state.release_read(&mut wakers),
                        WaitKind::UpgradeableRead => state.release_upgradeable_read(&mut wakers),
                        WaitKind::Write => state.release_write(&mut wakers),
                    };
                }
                Err(_) => {}
            }
        }
        if let (Some(token), Some(id)) = (&self.cancel, self.cancel_reg.take()) {
            token.deregister(id);
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Future returned by [`AcquireFuture::strict`].
#[must_use = "dropping an acquisition withdraws the request"]
#[derive(Debug)]
pub struct StrictFuture<'a> {
    inner: AcquireFuture<'a>,
}

impl Future for StrictFuture<'_> {
    type Output = Result<(), LockError>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(context).map(|result| match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(LockError::TimedOut),
            Err(error) => Err(error),
        })
    }
}
