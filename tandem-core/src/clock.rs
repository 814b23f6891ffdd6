//! Replica clock for op timestamps.
//!
//! Dates are milliseconds since the Unix epoch, bumped by a logical step
//! whenever the wall clock would not move forward. Observing a remote date
//! pulls the clock past it, so a replica never stamps a new op earlier than
//! an op it has already incorporated.
//!
//! ```text
//!   wall: 100   100   100   90 (skew)   ──►  dates: 100 101 102 103
//!   observe(500)                        ──►  next:  501
//! ```
//!
//! Reference: Kulkarni et al. — Logical Physical Clocks (HLC)

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Monotonic op-date generator for a single replica.
#[derive(Debug, Clone)]
pub struct Clock {
    source: String,
    last: u64,
    /// Signed correction applied to the wall clock (server date - local date).
    offset: i64,
    time_fn: fn() -> u64,
}

impl Clock {
    /// Create a clock for the given replica source id.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            last: 0,
            offset: 0,
            time_fn: wall_ms,
        }
    }

    /// Create a clock with a custom physical time source (tests, simulations).
    pub fn with_time_source(source: impl Into<String>, time_fn: fn() -> u64) -> Self {
        Self {
            source: source.into(),
            last: 0,
            offset: 0,
            time_fn,
        }
    }

    /// The replica id stamped on every op this clock dates.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Issue the next date. Strictly greater than every date issued or observed.
    pub fn now(&mut self) -> u64 {
        let wall = self.physical();
        self.last = wall.max(self.last + 1);
        self.last
    }

    /// Advance past a date seen on a remote op.
    pub fn observe(&mut self, date: u64) {
        if date > self.last {
            self.last = date;
        }
    }

    /// Align with a reference clock (typically the server's handshake date).
    pub fn sync_with(&mut self, reference_ms: u64) {
        let local = (self.time_fn)() as i64;
        self.offset = reference_ms as i64 - local;
    }

    /// Current offset against the reference clock.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Last date issued or observed.
    pub fn last(&self) -> u64 {
        self.last
    }

    fn physical(&self) -> u64 {
        let raw = (self.time_fn)() as i64 + self.offset;
        raw.max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frozen() -> u64 {
        1_000
    }

    #[test]
    fn test_now_is_strictly_monotonic() {
        let mut clock = Clock::with_time_source("a", frozen);
        let d1 = clock.now();
        let d2 = clock.now();
        let d3 = clock.now();
        assert_eq!(d1, 1_000);
        assert!(d2 > d1);
        assert!(d3 > d2);
    }

    #[test]
    fn test_observe_pulls_clock_forward() {
        let mut clock = Clock::with_time_source("a", frozen);
        clock.observe(5_000);
        assert_eq!(clock.now(), 5_001);
    }

    #[test]
    fn test_observe_older_date_is_ignored() {
        let mut clock = Clock::with_time_source("a", frozen);
        clock.now();
        clock.observe(10);
        assert_eq!(clock.last(), 1_000);
    }

    #[test]
    fn test_sync_with_applies_offset() {
        let mut clock = Clock::with_time_source("a", frozen);
        clock.sync_with(3_000);
        assert_eq!(clock.offset(), 2_000);
        assert_eq!(clock.now(), 3_000);
    }

    #[test]
    fn test_source() {
        let clock = Clock::new("replica-1");
        assert_eq!(clock.source(), "replica-1");
    }
}
