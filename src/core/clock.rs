//! Monotonic message clock

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Hands out strictly increasing millisecond timestamps.
///
/// When two calls land in the same millisecond (or the wall clock steps
/// backwards) the second call gets `last + 1`.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp in milliseconds since the epoch
    pub fn now(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let bump = |last: i64| if wall > last { wall } else { last + 1 };
        let prev = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(bump(last)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        bump(prev)
    }

    /// Make sure future timestamps sort after `timestamp` (used after loading history)
    pub fn observe(&self, timestamp: i64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }
}
