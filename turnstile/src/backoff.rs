//! Retry pacing for the client's poll loop.
//!
//! Decorrelated jitter: each wait is drawn uniformly from
//! `[base, prev * 3]` and clamped into `[base, cap]`. Spreading reconnects
//! this way avoids a thundering herd of clients hammering a proxy that just
//! came back.

use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE: Duration = Duration::from_millis(50);
const DEFAULT_CAP: Duration = Duration::from_secs(5);

/// A decorrelated-jitter backoff policy. Never gives up; callers decide when
/// to stop retrying.
#[derive(Debug, Clone, Copy)]
pub struct DecorrelatedJitter {
    base: Duration,
    cap: Duration,
    prev: Duration,
}

impl Default for DecorrelatedJitter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

impl DecorrelatedJitter {
    /// Create a policy bounded by `base` and `cap`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is greater than `cap`. Sharp corners.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        assert!(base <= cap, "backoff base must not exceed cap");
        Self {
            base,
            cap,
            prev: base,
        }
    }

    /// The next wait. Grows by at most 3x per call, bounded by the cap.
    pub fn next_wait(&mut self) -> Duration {
        let upper = self
            .prev
            .saturating_mul(3)
            .clamp(self.base, self.cap)
            .as_nanos();
        let lower = self.base.as_nanos();
        let drawn = if upper > lower {
            rand::rng().random_range(lower..=upper)
        } else {
            lower
        };
        // Durations in this policy are all well under u64::MAX nanoseconds.
        #[allow(clippy::cast_possible_truncation)]
        let wait = Duration::from_nanos(drawn as u64);
        self.prev = wait;
        wait
    }

    /// Forget accumulated growth after a successful attempt.
    pub fn reset(&mut self) {
        self.prev = self.base;
    }
}
