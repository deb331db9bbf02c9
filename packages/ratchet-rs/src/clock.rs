//! Wall-clock abstraction and the monotonic stamp discipline.
//!
//! Event timestamps must be non-decreasing within one actor's log even
//! when the wall clock steps backwards (NTP, VM migration). The
//! [`MonotonicStamper`] clamps retrograde reads to the previous stamp plus
//! one nanosecond.

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock time.
///
/// Production uses [`SystemClock`]; tests inject a manual clock to make
/// retrograde behavior reproducible.
pub trait Clock: Send + Sync + 'static {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Issues monotonic non-decreasing timestamps from a possibly-unruly clock.
///
/// Owned by one actor (single writer), so no synchronization is needed.
#[derive(Debug, Default)]
pub struct MonotonicStamper {
    last: Option<DateTime<Utc>>,
}

impl MonotonicStamper {
    /// Create a stamper with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the stamper with the newest timestamp seen during replay.
    ///
    /// Fresh fires after activation must not stamp earlier than the tail
    /// of the log.
    pub fn observe(&mut self, stamp: DateTime<Utc>) {
        if self.last.is_none_or(|last| stamp > last) {
            self.last = Some(stamp);
        }
    }

    /// Read the clock, clamping retrograde values to `previous + 1ns`.
    pub fn next(&mut self, clock: &dyn Clock) -> DateTime<Utc> {
        let now = clock.now();
        let stamp = match self.last {
            Some(last) if now <= last => last + Duration::nanoseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }

    /// The most recent stamp issued or observed.
    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }
}
