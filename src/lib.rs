//! Uplock: asynchronous synchronization primitives with handoff grants.
//!
//! # Overview
//!
//! The centerpiece is [`ReaderWriterLock`], a reader/writer lock with an
//! *upgradeable* read mode: one reader at a time may reserve the right to
//! take the write mode in place, without releasing first. Around it sit
//! two siblings on the same machinery, [`Semaphore`] and
//! [`ManualResetEvent`].
//!
//! Acquisition never parks an OS thread. A request is decided at call
//! time under the primitive's monitor: granted on the spot (the returned
//! future is already resolved) or appended to a strict-FIFO wait queue.
//! Releases are synchronous state transitions that complete the signals
//! of the waiters whose turn has come; their wakers run only after the
//! monitor is released.
//!
//! # Core guarantees
//!
//! - **Strict FIFO fairness**: no arriving request overtakes a queued
//!   request of an incompatible mode; writers cannot be starved
//! - **Exactly-one resolution**: grant, deadline, cancellation, and
//!   disposal race, and exactly one wins per wait
//! - **Cancel safety**: a withdrawn waiter leaves the queue; a grant
//!   that was committed but never observed is handed back
//! - **Bounded waits**: every acquire takes a [`Wait`] spec with an
//!   optional [`Deadline`] and [`CancelToken`]
//!
//! # Module structure
//!
//! - [`sync`]: the primitives ([`ReaderWriterLock`], [`Semaphore`],
//!   [`ManualResetEvent`]) and the [`Wait`] spec
//! - [`time`]: deadlines and the wakeup timer behind them
//! - [`cancel`]: cancellation sources and tokens
//! - [`error`]: the unified [`LockError`] kinds
//! - [`test_utils`]: logging setup and manual-poll helpers for tests
//!
//! # Example
//!
//! ```
//! use uplock::{ReaderWriterLock, Wait};
//! use uplock::test_utils::poll_until_ready;
//!
//! let lock = ReaderWriterLock::new();
//!
//! // Take the upgradeable read mode, then upgrade in place.
//! assert_eq!(poll_until_ready(lock.upgradeable_read(Wait::FOREVER)), Ok(true));
//! assert_eq!(poll_until_ready(lock.write(Wait::FOREVER)), Ok(true));
//!
//! // Release in reverse order: the write first.
//! lock.release_write().unwrap();
//! lock.release_upgradeable_read().unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod error;
mod signal;
pub mod sync;
pub mod test_utils;
pub mod time;

pub use cancel::{CancelSource, CancelToken};
pub use error::LockError;
pub use sync::{ManualResetEvent, ReaderWriterLock, Semaphore, Wait};
pub use time::Deadline;
