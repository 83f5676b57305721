//! Time abstractions for blocking kernel calls

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timeout accepted by every blocking call
///
/// Zero means "poll only, never block". [`Timeout::INFINITE`] blocks until
/// the condition holds or the handle is closed. Applications pass timeouts in
/// milliseconds, with `u64::MAX` as the infinite sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timeout {
    millis: u64,
}

impl Timeout {
    /// Never block
    pub const ZERO: Timeout = Timeout { millis: 0 };

    /// Never expire
    pub const INFINITE: Timeout = Timeout { millis: u64::MAX };

    /// Creates a timeout from the millisecond value passed at the syscall boundary
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Creates a timeout from a duration, saturating at the infinite sentinel
    pub fn from_duration(duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self { millis }
    }

    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    pub const fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub const fn is_infinite(&self) -> bool {
        self.millis == u64::MAX
    }

    /// Starts the clock for this timeout
    pub fn start(self) -> Deadline {
        if self.is_infinite() {
            Deadline { at: None }
        } else {
            Deadline {
                at: Instant::now().checked_add(Duration::from_millis(self.millis)),
            }
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

/// A running timeout
///
/// Blocking loops compute the remaining time on every wakeup so spurious
/// wakeups never extend the total wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// `None` when the deadline never expires
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires
    pub const fn never() -> Self {
        Self { at: None }
    }

    /// Time left before expiry; `None` for an infinite deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_sentinels() {
        assert!(Timeout::ZERO.is_zero());
        assert!(!Timeout::ZERO.is_infinite());
        assert!(Timeout::INFINITE.is_infinite());
        assert_eq!(Timeout::from_millis(u64::MAX), Timeout::INFINITE);
    }

    #[test]
    fn test_timeout_from_duration() {
        assert_eq!(
            Timeout::from_duration(Duration::from_secs(2)).as_millis(),
            2000
        );
        assert_eq!(Timeout::from(Duration::MAX), Timeout::INFINITE);
    }

    #[test]
    fn test_zero_deadline_is_expired() {
        let deadline = Timeout::ZERO.start();
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_infinite_deadline_never_expires() {
        let deadline = Timeout::INFINITE.start();
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
        assert_eq!(Deadline::never(), deadline);
    }

    #[test]
    fn test_finite_deadline_counts_down() {
        let deadline = Timeout::from_millis(10_000).start();
        let left = deadline.remaining().unwrap();
        assert!(left <= Duration::from_millis(10_000));
        assert!(left > Duration::from_millis(9_000));
        assert!(!deadline.is_expired());
    }
}
