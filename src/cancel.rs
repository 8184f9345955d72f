//! External cancellation for pending acquisitions.
//!
//! A [`CancelSource`] owns the trip wire; [`CancelToken`] is the cheaply
//! clonable observer passed into acquire calls. Tripping the source wakes
//! every registered waiter exactly once so each can resolve its own wait
//! (the token never mutates lock state itself — resolution happens in the
//! waiter's poll, under the owning primitive's monitor).
//!
//! Waiter storage reuses freed slots so long-lived tokens shared by many
//! short waits do not grow without bound.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;

#[derive(Debug)]
struct TokenWaiters {
    entries: Vec<Option<Waker>>,
    /// Free-slot indices for reuse. `SmallVec<4>` avoids heap allocation
    /// for the common case of few concurrent waiters.
    free_slots: SmallVec<[usize; 4]>,
}

impl TokenWaiters {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_slots: SmallVec::new(),
        }
    }

    fn insert(&mut self, waker: Waker) -> usize {
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = Some(waker);
            index
        } else {
            let index = self.entries.len();
            self.entries.push(Some(waker));
            index
        }
    }

    fn remove(&mut self, index: usize) {
        if index < self.entries.len() && self.entries[index].take().is_some() {
            self.free_slots.push(index);
        }
    }

    fn take_all(&mut self) -> SmallVec<[Waker; 4]> {
        let wakers = self.entries.iter_mut().filter_map(Option::take).collect();
        self.entries.clear();
        self.free_slots.clear();
        wakers
    }
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<TokenWaiters>,
}

/// The owning side of a cancellation pair.
///
/// # Example
///
/// ```
/// use uplock::CancelSource;
///
/// let source = CancelSource::new();
/// let token = source.token();
/// assert!(!token.is_cancelled());
///
/// source.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug)]
pub struct CancelSource {
    inner: Arc<CancelInner>,
}

impl CancelSource {
    /// Creates an untripped cancellation source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                waiters: Mutex::new(TokenWaiters::new()),
            }),
        }
    }

    /// Returns an observer token for this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Trips the source, waking every registered waiter. Idempotent.
    pub fn cancel(&self) {
        let wakers = {
            let mut waiters = self.inner.waiters.lock();
            // The flag flips under the waiter lock so a concurrent
            // registration either sees the flag or leaves a waker we
            // drain here; either way the waiter gets exactly one wake.
            if self.inner.cancelled.swap(true, Ordering::Release) {
                return;
            }
            waiters.take_all()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns true once the source has been tripped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer handle that pending acquisitions watch.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Returns true once the owning source has been tripped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Registers a waker to be invoked when the token trips.
    ///
    /// Returns `None` when the token is already tripped — the caller
    /// must resolve its wait immediately instead of parking.
    pub(crate) fn register(&self, waker: &Waker) -> Option<usize> {
        let mut waiters = self.inner.waiters.lock();
        if self.inner.cancelled.load(Ordering::Acquire) {
            return None;
        }
        Some(waiters.insert(waker.clone()))
    }

    /// Replaces the waker stored under `id` if the task has migrated.
    pub(crate) fn update(&self, id: usize, waker: &Waker) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(slot) = waiters.entries.get_mut(id) {
            match slot {
                Some(existing) if existing.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }
    }

    /// Removes the registration under `id`.
    pub(crate) fn deregister(&self, id: usize) {
        self.inner.waiters.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, CountingWaker};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn cancel_is_idempotent_and_observable() {
        init_test("cancel_is_idempotent_and_observable");
        let source = CancelSource::new();
        let token = source.token();

        crate::assert_with_log!(!token.is_cancelled(), "starts clear", false, token.is_cancelled());
        source.cancel();
        source.cancel();
        crate::assert_with_log!(token.is_cancelled(), "tripped", true, token.is_cancelled());
        crate::assert_with_log!(source.is_cancelled(), "source agrees", true, source.is_cancelled());
        crate::test_complete!("cancel_is_idempotent_and_observable");
    }

    #[test]
    fn cancel_wakes_registered_waiters_once() {
        init_test("cancel_wakes_registered_waiters_once");
        let source = CancelSource::new();
        let token = source.token();

        let w1 = CountingWaker::new();
        let w2 = CountingWaker::new();
        let id1 = token
            .register(&Waker::from(Arc::clone(&w1)))
            .expect("register before cancel");
        let _id2 = token
            .register(&Waker::from(Arc::clone(&w2)))
            .expect("register before cancel");

        source.cancel();
        crate::assert_with_log!(w1.count() == 1, "first woken once", 1usize, w1.count());
        crate::assert_with_log!(w2.count() == 1, "second woken once", 1usize, w2.count());

        // A second trip must not wake anyone again.
        source.cancel();
        crate::assert_with_log!(w1.count() == 1, "no double wake", 1usize, w1.count());

        // Stale deregistration after the trip is a no-op.
        token.deregister(id1);
        crate::test_complete!("cancel_wakes_registered_waiters_once");
    }

    #[test]
    fn register_after_trip_is_refused() {
        init_test("register_after_trip_is_refused");
        let source = CancelSource::new();
        let token = source.token();
        source.cancel();

        let refused = token.register(Waker::noop()).is_none();
        crate::assert_with_log!(refused, "registration refused", true, refused);
        crate::test_complete!("register_after_trip_is_refused");
    }

    #[test]
    fn deregistered_waiter_is_not_woken() {
        init_test("deregistered_waiter_is_not_woken");
        let source = CancelSource::new();
        let token = source.token();

        let w1 = CountingWaker::new();
        let id = token
            .register(&Waker::from(Arc::clone(&w1)))
            .expect("register");
        token.deregister(id);

        source.cancel();
        crate::assert_with_log!(w1.count() == 0, "deregistered not woken", 0usize, w1.count());
        crate::test_complete!("deregistered_waiter_is_not_woken");
    }

    #[test]
    fn slots_are_reused_after_deregistration() {
        init_test("slots_are_reused_after_deregistration");
        let source = CancelSource::new();
        let token = source.token();

        let id_a = token.register(Waker::noop()).expect("register a");
        token.deregister(id_a);
        let id_b = token.register(Waker::noop()).expect("register b");
        crate::assert_with_log!(id_a == id_b, "slot reused", id_a, id_b);
        crate::test_complete!("slots_are_reused_after_deregistration");
    }
}
