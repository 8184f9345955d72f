//! Timer heap and wakeup thread for deadline-driven polls.
//!
//! Waits with a finite [`Deadline`](super::Deadline) check the clock in
//! their own `poll`; this module only guarantees that a poll *happens*
//! once the deadline passes. A single lazily-started thread sleeps until
//! the earliest armed deadline and fires the registered wakers.
//!
//! Entries are removed lazily: dropping a [`TimerWakeup`] disarms its
//! entry, and the thread discards disarmed entries when they surface at
//! the top of the heap. Waking a future whose wait has already resolved
//! is harmless — it re-polls, observes the terminal signal, and returns.

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::time::Instant;

/// Registration guard for one deadline wakeup. Dropping it disarms the
/// entry; the heap slot is reclaimed when it reaches the top.
#[derive(Debug)]
pub(crate) struct TimerWakeup {
    armed: Arc<AtomicBool>,
}

impl Drop for TimerWakeup {
    fn drop(&mut self) {
        self.armed.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    generation: u64,
    waker: Waker,
    armed: Arc<AtomicBool>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of armed wakeups ordered by deadline.
#[derive(Debug, Default)]
struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    fn insert(&mut self, deadline: Instant, waker: Waker) -> TimerWakeup {
        let armed = Arc::new(AtomicBool::new(true));
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            generation,
            waker,
            armed: Arc::clone(&armed),
        });
        TimerWakeup { armed }
    }

    /// Earliest armed deadline, discarding disarmed entries on the way.
    fn peek_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if entry.armed.load(Ordering::Acquire) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the wakers of all armed entries whose deadline is `<= now`.
    fn pop_expired(&mut self, now: Instant) -> SmallVec<[Waker; 4]> {
        let mut expired = SmallVec::new();
        while let Some(entry) = self.heap.peek() {
            if !entry.armed.load(Ordering::Acquire) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                expired.push(entry.waker);
            }
        }
        expired
    }
}

#[derive(Debug, Default)]
struct TimerShared {
    heap: Mutex<TimerHeap>,
    tick: Condvar,
}

static TIMER: OnceLock<Arc<TimerShared>> = OnceLock::new();

fn shared() -> &'static Arc<TimerShared> {
    TIMER.get_or_init(|| {
        let shared = Arc::new(TimerShared::default());
        let for_thread = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("uplock-timer".into())
            .spawn(move || run(&for_thread))
            .expect("failed to spawn timer thread");
        shared
    })
}

fn run(shared: &TimerShared) {
    let mut heap = shared.heap.lock();
    loop {
        let expired = heap.pop_expired(Instant::now());
        if !expired.is_empty() {
            // Wakers run arbitrary continuations; never invoke them while
            // holding the heap lock.
            drop(heap);
            tracing::trace!(count = expired.len(), "timer deadlines fired");
            for waker in expired {
                waker.wake();
            }
            heap = shared.heap.lock();
            continue;
        }
        match heap.peek_deadline() {
            Some(deadline) => {
                let _ = shared.tick.wait_until(&mut heap, deadline);
            }
            None => shared.tick.wait(&mut heap),
        }
    }
}

/// Arms a wakeup: `waker` is invoked at (or shortly after) `deadline`
/// unless the returned guard is dropped first.
pub(crate) fn register_wakeup(deadline: Instant, waker: Waker) -> TimerWakeup {
    let shared = shared();
    let (wakeup, is_earliest) = {
        let mut heap = shared.heap.lock();
        let earliest = heap.peek_deadline();
        let wakeup = heap.insert(deadline, waker);
        (wakeup, earliest.is_none_or(|e| deadline < e))
    };
    if is_earliest {
        shared.tick.notify_one();
    }
    wakeup
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, CountingWaker};
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn wakeup_fires_after_deadline() {
        init_test("wakeup_fires_after_deadline");
        let counter = CountingWaker::new();
        let wakeup = register_wakeup(
            Instant::now() + Duration::from_millis(20),
            Waker::from(Arc::clone(&counter)),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        crate::assert_with_log!(counter.count() >= 1, "waker fired", true, counter.count() >= 1);
        drop(wakeup);
        crate::test_complete!("wakeup_fires_after_deadline");
    }

    #[test]
    fn disarmed_wakeup_does_not_fire() {
        init_test("disarmed_wakeup_does_not_fire");
        let counter = CountingWaker::new();
        let wakeup = register_wakeup(
            Instant::now() + Duration::from_millis(30),
            Waker::from(Arc::clone(&counter)),
        );
        drop(wakeup);

        std::thread::sleep(Duration::from_millis(80));
        crate::assert_with_log!(counter.count() == 0, "disarmed silent", 0usize, counter.count());
        crate::test_complete!("disarmed_wakeup_does_not_fire");
    }

    #[test]
    fn earlier_registration_preempts_later_sleep() {
        init_test("earlier_registration_preempts_later_sleep");
        let slow = CountingWaker::new();
        let fast = CountingWaker::new();
        let _slow_wakeup = register_wakeup(
            Instant::now() + Duration::from_secs(30),
            Waker::from(Arc::clone(&slow)),
        );
        // The thread is now asleep until the 30s entry; a nearer deadline
        // must preempt that sleep.
        let _fast_wakeup = register_wakeup(
            Instant::now() + Duration::from_millis(20),
            Waker::from(Arc::clone(&fast)),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while fast.count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        crate::assert_with_log!(fast.count() >= 1, "near deadline fired", true, fast.count() >= 1);
        crate::assert_with_log!(slow.count() == 0, "far deadline pending", 0usize, slow.count());
        crate::test_complete!("earlier_registration_preempts_later_sleep");
    }
}
