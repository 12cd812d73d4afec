//! Security counters.
//!
//! Receive-path failures are dropped rather than raised, so these counters
//! are how an operator sees replays, forgeries and garbage traffic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of security-relevant receive failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityEventType {
    /// Sequence already punctured
    Replay,
    /// AEAD tag mismatch
    AuthenticationFailure,
    /// Header or body failed to parse
    Malformed,
    /// Route id not known to this core
    UnknownRoute,
}

/// Atomic security counters.
#[derive(Debug, Default)]
pub struct SecurityMetrics {
    replays: AtomicU64,
    authentication_failures: AtomicU64,
    malformed: AtomicU64,
    unknown_routes: AtomicU64,
}

impl SecurityMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event.
    pub fn record(&self, event: SecurityEventType) {
        let counter = match event {
            SecurityEventType::Replay => &self.replays,
            SecurityEventType::AuthenticationFailure => &self.authentication_failures,
            SecurityEventType::Malformed => &self.malformed,
            SecurityEventType::UnknownRoute => &self.unknown_routes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> SecurityMetricsSnapshot {
        SecurityMetricsSnapshot {
            replays: self.replays.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_routes: self.unknown_routes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time security counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityMetricsSnapshot {
    /// Replayed sequences rejected
    pub replays: u64,
    /// Forged or corrupted payloads rejected
    pub authentication_failures: u64,
    /// Unparseable datagrams or bodies
    pub malformed: u64,
    /// Datagrams for unknown routes
    pub unknown_routes: u64,
}

impl SecurityMetricsSnapshot {
    /// Sum of all counters.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.replays + self.authentication_failures + self.malformed + self.unknown_routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = SecurityMetrics::new();
        metrics.record(SecurityEventType::Replay);
        metrics.record(SecurityEventType::Replay);
        metrics.record(SecurityEventType::UnknownRoute);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.replays, 2);
        assert_eq!(snapshot.unknown_routes, 1);
        assert_eq!(snapshot.authentication_failures, 0);
        assert_eq!(snapshot.total(), 3);
    }
}
