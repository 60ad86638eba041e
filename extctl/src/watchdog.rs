//! Reply deadline for the synchronous send/receive cycle.
//!
//! The watchdog is armed at every send and disarmed when the matching reply
//! is processed. Expiry is decided purely from monotonic clock samples taken
//! by the caller at the waiting point, never from loop iteration counts, so
//! it fires on time no matter how long decode and compute take.

use std::time::Duration;

use minstant::Instant;

/// Default reply deadline.
pub const DEFAULT_REPLY_DEADLINE: Duration = Duration::from_millis(5000);

/// Deadline tracker for the outstanding command.
#[derive(Debug, Clone)]
pub struct Watchdog {
    deadline: Duration,
    armed_at: Option<Instant>,
}

impl Watchdog {
    /// Creates a disarmed watchdog.
    #[must_use]
    pub const fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            armed_at: None,
        }
    }

    /// Configured deadline.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Starts (or restarts) the deadline clock at `now`.
    pub fn arm(&mut self, now: Instant) {
        self.armed_at = Some(now);
    }

    /// Stops the clock; a disarmed watchdog never expires.
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Time elapsed since the watchdog was armed.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.armed_at
            .map(|armed| now.saturating_duration_since(armed))
    }

    /// Time left before expiry, `None` when disarmed.
    ///
    /// Returns `Some(Duration::ZERO)` once the deadline has passed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.elapsed(now)
            .map(|elapsed| self.deadline.saturating_sub(elapsed))
    }

    /// Whether the deadline has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.elapsed(now)
            .is_some_and(|elapsed| elapsed >= self.deadline)
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_DEADLINE)
    }
}
