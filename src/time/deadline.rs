//! Deadline type for bounded waits.

use std::time::{Duration, Instant};

use crate::error::LockError;

/// When a pending acquisition gives up.
///
/// The default is [`Never`](Self::Never): wait until granted, cancelled,
/// or disposed. Deadlines are cooperative — a waiter observes an elapsed
/// deadline the next time it is polled, and the timer thread guarantees
/// that poll happens.
///
/// # Example
///
/// ```
/// use uplock::Deadline;
/// use std::time::Duration;
///
/// assert!(!Deadline::NEVER.is_elapsed());
/// assert!(Deadline::after(Duration::ZERO).is_elapsed());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deadline {
    /// Wait indefinitely.
    #[default]
    Never,
    /// Give up once this instant is reached.
    At(Instant),
}

impl Deadline {
    /// The infinite deadline.
    pub const NEVER: Self = Self::Never;

    /// A deadline `timeout` from now. Saturates to [`Never`](Self::Never)
    /// when the instant is unrepresentable.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Never, Self::At)
    }

    /// A deadline at an absolute instant.
    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self::At(instant)
    }

    /// Builds a deadline from a millisecond count, the way millisecond
    /// timeout APIs are conventionally shaped: `-1` is the infinite
    /// sentinel, any other negative value is rejected before a wait is
    /// registered.
    ///
    /// # Example
    ///
    /// ```
    /// use uplock::{Deadline, LockError};
    ///
    /// assert_eq!(Deadline::from_millis(-1), Ok(Deadline::NEVER));
    /// assert!(Deadline::from_millis(250).is_ok());
    /// assert_eq!(Deadline::from_millis(-7), Err(LockError::InvalidDeadline));
    /// ```
    pub fn from_millis(millis: i64) -> Result<Self, LockError> {
        match millis {
            -1 => Ok(Self::Never),
            m if m >= 0 => Ok(Self::after(Duration::from_millis(m.unsigned_abs()))),
            _ => Err(LockError::InvalidDeadline),
        }
    }

    /// Returns true once the deadline has passed. [`Never`](Self::Never)
    /// never elapses.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        match self {
            Self::Never => false,
            Self::At(instant) => Instant::now() >= *instant,
        }
    }

    /// Returns the absolute instant, if finite.
    #[must_use]
    pub const fn instant(&self) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::At(instant) => Some(*instant),
        }
    }

    /// Time left until the deadline; `None` for the infinite deadline,
    /// zero once elapsed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::At(instant) => Some(instant.saturating_duration_since(Instant::now())),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::after(timeout)
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(Self::Never, Self::after)
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::At(instant)
    }
}
