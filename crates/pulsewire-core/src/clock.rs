//! Injectable time source.
//!
//! Pulse timers, throttle recovery and key-record timestamps read time from
//! a [`Clock`] so the protocol can be driven deterministically in tests with
//! a [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant used for deadlines and elapsed-time checks.
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;

    /// Unix milliseconds truncated to 32 bits, as carried in datagram headers.
    fn wire_timestamp(&self) -> u32 {
        (self.unix_millis() & u64::from(u32::MAX)) as u32
    }
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Both the monotonic and the wall clock move only when [`ManualClock::advance`]
/// is called.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    origin_unix_ms: u64,
    offset_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock whose wall time starts at `unix_ms`.
    #[must_use]
    pub fn new(unix_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_unix_ms: unix_ms,
            offset_ms: AtomicU64::new(0),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total time advanced since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn unix_millis(&self) -> u64 {
        self.origin_unix_ms + self.offset_ms.load(Ordering::SeqCst)
    }
}

/// Milliseconds elapsed between two wire timestamps, tolerant of the 2^32 wrap.
#[must_use]
pub fn wire_elapsed(now: u32, then: u32) -> Duration {
    Duration::from_millis(u64::from(now.wrapping_sub(then)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        let start = clock.now();

        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(clock.unix_millis(), 1_250);
    }

    #[test]
    fn test_wire_timestamp_truncates() {
        let clock = ManualClock::new(u64::from(u32::MAX) + 10);
        assert_eq!(clock.wire_timestamp(), 9);
    }

    #[test]
    fn test_wire_elapsed_wraps() {
        assert_eq!(wire_elapsed(150, 100), Duration::from_millis(50));
        assert_eq!(wire_elapsed(5, u32::MAX - 4), Duration::from_millis(10));
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.unix_millis() > 1_577_836_800_000);
    }
}
