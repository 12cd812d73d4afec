//! Pulse/gap tracking.
//!
//! Per peer, the tracker keeps the next sequence it expects. A receipt that
//! jumps ahead opens a gap for every skipped sequence; those are the
//! sequences to request via NACK. Late arrivals (retransmits or reordering)
//! close their gap. Backward or duplicate receipts never open gaps.
//!
//! Keep-alive and liveness are deadline checks against the injected clock:
//! nothing here sleeps or spawns timers.

use crate::clock::Clock;
use crate::config::PulseConfig;
use crate::{PeerId, short_id};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-peer pulse state
#[derive(Debug, Clone)]
struct PulseState {
    // u64 so that "everything up to u32::MAX seen" is representable
    expected_sequence: u64,
    last_pulse_at: Instant,
    missed_pulse_count: u32,
    gap_set: BTreeSet<u32>,
    last_received_at: Instant,
    received_since_pulse: bool,
}

impl PulseState {
    fn new(now: Instant) -> Self {
        Self {
            expected_sequence: 0,
            last_pulse_at: now,
            missed_pulse_count: 0,
            gap_set: BTreeSet::new(),
            last_received_at: now,
            received_since_pulse: false,
        }
    }
}

/// Tracks expected sequences, gaps and liveness per peer.
pub struct PulseTracker {
    peers: DashMap<PeerId, PulseState>,
    config: PulseConfig,
    clock: Arc<dyn Clock>,
}

impl PulseTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(config: PulseConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            peers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Start tracking a peer (resets existing state).
    pub fn register(&self, peer_id: PeerId) {
        self.peers.insert(peer_id, PulseState::new(self.clock.now()));
    }

    /// Record receipt of `sequence` and return the gaps it opened.
    ///
    /// Unknown peers are registered on first receipt.
    pub fn on_receive(&self, peer_id: &PeerId, sequence: u32) -> Vec<u32> {
        let now = self.clock.now();
        let mut state = self
            .peers
            .entry(*peer_id)
            .or_insert_with(|| PulseState::new(now));
        self.record(peer_id, &mut state, sequence, now)
    }

    /// [`PulseTracker::on_receive`] for registered peers only.
    ///
    /// Returns `None` (and tracks nothing) if the peer is unknown.
    pub fn on_receive_tracked(&self, peer_id: &PeerId, sequence: u32) -> Option<Vec<u32>> {
        let now = self.clock.now();
        let mut state = self.peers.get_mut(peer_id)?;
        Some(self.record(peer_id, &mut state, sequence, now))
    }

    fn record(&self, peer_id: &PeerId, state: &mut PulseState, sequence: u32, now: Instant) -> Vec<u32> {
        state.last_received_at = now;
        state.received_since_pulse = true;
        state.missed_pulse_count = 0;
        state.gap_set.remove(&sequence);

        let sequence = u64::from(sequence);
        let mut opened = Vec::new();

        if sequence > state.expected_sequence {
            let cap = self.config.max_tracked_gaps as u64;
            // Only the newest `cap` skipped sequences can survive eviction
            let start = state.expected_sequence.max(sequence.saturating_sub(cap));
            for missing in start..sequence {
                // Range is bounded by a u32 sequence
                let missing = missing as u32;
                if state.gap_set.insert(missing) {
                    opened.push(missing);
                }
            }

            while state.gap_set.len() > self.config.max_tracked_gaps {
                if let Some(evicted) = state.gap_set.pop_first() {
                    opened.retain(|s| *s != evicted);
                }
            }

            if !opened.is_empty() {
                tracing::debug!(
                    "Gap detected from {}: {} missing before {}",
                    short_id(peer_id),
                    opened.len(),
                    sequence
                );
            }
        }

        state.expected_sequence = state.expected_sequence.max(sequence + 1);
        opened
    }

    /// Whether a keep-alive is due. Resets the pulse timer when it fires.
    ///
    /// Each firing with nothing received since the previous one counts as a
    /// missed pulse.
    pub fn should_pulse(&self, peer_id: &PeerId) -> bool {
        let now = self.clock.now();
        let Some(mut state) = self.peers.get_mut(peer_id) else {
            return false;
        };

        if now.saturating_duration_since(state.last_pulse_at) < self.config.interval() {
            return false;
        }

        if !state.received_since_pulse {
            state.missed_pulse_count = state.missed_pulse_count.saturating_add(1);
        }
        state.received_since_pulse = false;
        state.last_pulse_at = now;
        true
    }

    /// Whether the peer has been heard from within the liveness timeout.
    ///
    /// Unknown peers are unhealthy.
    #[must_use]
    pub fn is_healthy(&self, peer_id: &PeerId) -> bool {
        let now = self.clock.now();
        self.peers.get(peer_id).is_some_and(|state| {
            now.saturating_duration_since(state.last_received_at) < self.config.liveness_timeout()
        })
    }

    /// Time since the peer was last heard from.
    #[must_use]
    pub fn silence(&self, peer_id: &PeerId) -> Option<Duration> {
        let now = self.clock.now();
        self.peers
            .get(peer_id)
            .map(|state| now.saturating_duration_since(state.last_received_at))
    }

    /// Outstanding gaps, ascending.
    #[must_use]
    pub fn pending_gaps(&self, peer_id: &PeerId) -> Vec<u32> {
        self.peers
            .get(peer_id)
            .map(|state| state.gap_set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forget gaps below `floor`: the sender can no longer retransmit them.
    ///
    /// Returns the number of gaps dropped.
    pub fn discard_gaps_below(&self, peer_id: &PeerId, floor: u32) -> usize {
        let Some(mut state) = self.peers.get_mut(peer_id) else {
            return 0;
        };
        let kept = state.gap_set.split_off(&floor);
        let dropped = state.gap_set.len();
        state.gap_set = kept;
        dropped
    }

    /// Consecutive pulses fired without hearing from the peer.
    #[must_use]
    pub fn missed_pulses(&self, peer_id: &PeerId) -> u32 {
        self.peers.get(peer_id).map_or(0, |state| state.missed_pulse_count)
    }

    /// Next sequence the tracker expects from the peer.
    #[must_use]
    pub fn expected_sequence(&self, peer_id: &PeerId) -> Option<u64> {
        self.peers.get(peer_id).map(|state| state.expected_sequence)
    }

    /// Tracked peers.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop all state for the peer. Returns whether the peer was tracked.
    pub fn cleanup(&self, peer_id: &PeerId) -> bool {
        self.peers.remove(peer_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const PEER: PeerId = [7u8; 32];

    fn tracker() -> (PulseTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (PulseTracker::new(PulseConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_gap_detection() {
        let (t, _) = tracker();
        assert!(t.on_receive(&PEER, 0).is_empty());
        assert!(t.on_receive(&PEER, 1).is_empty());
        assert_eq!(t.on_receive(&PEER, 3), vec![2]);
        assert_eq!(t.pending_gaps(&PEER), vec![2]);
    }

    #[test]
    fn test_late_arrival_closes_gap() {
        let (t, _) = tracker();
        assert_eq!(t.on_receive(&PEER, 4), vec![0, 1, 2, 3]);

        assert!(t.on_receive(&PEER, 2).is_empty());
        assert_eq!(t.pending_gaps(&PEER), vec![0, 1, 3]);
        assert_eq!(t.expected_sequence(&PEER), Some(5));
    }

    #[test]
    fn test_duplicate_does_not_reopen_gap() {
        let (t, _) = tracker();
        t.on_receive(&PEER, 0);
        t.on_receive(&PEER, 1);
        t.on_receive(&PEER, 2);

        assert!(t.on_receive(&PEER, 1).is_empty());
        assert!(t.on_receive(&PEER, 0).is_empty());
        assert!(t.pending_gaps(&PEER).is_empty());
        assert_eq!(t.expected_sequence(&PEER), Some(3));
    }

    #[test]
    fn test_gap_cap_evicts_oldest() {
        let clock = Arc::new(ManualClock::default());
        let config = PulseConfig {
            max_tracked_gaps: 4,
            ..PulseConfig::default()
        };
        let t = PulseTracker::new(config, clock);

        assert_eq!(t.on_receive(&PEER, 3), vec![0, 1, 2]);
        assert_eq!(t.on_receive(&PEER, 6), vec![4, 5]);
        assert_eq!(t.pending_gaps(&PEER), vec![1, 2, 4, 5]);

        // A huge jump only ever tracks the newest gaps
        assert_eq!(t.on_receive(&PEER, 1_000_000), vec![999_996, 999_997, 999_998, 999_999]);
        assert_eq!(t.pending_gaps(&PEER).len(), 4);
    }

    #[test]
    fn test_discard_gaps_below() {
        let (t, _) = tracker();
        t.on_receive(&PEER, 6);
        assert_eq!(t.discard_gaps_below(&PEER, 3), 3);
        assert_eq!(t.pending_gaps(&PEER), vec![3, 4, 5]);
        assert_eq!(t.discard_gaps_below(&[0u8; 32], 3), 0);
    }

    #[test]
    fn test_max_sequence() {
        let (t, _) = tracker();
        t.on_receive(&PEER, u32::MAX);
        assert_eq!(t.expected_sequence(&PEER), Some(u64::from(u32::MAX) + 1));
        assert!(t.on_receive(&PEER, u32::MAX).is_empty());
    }

    #[test]
    fn test_should_pulse_interval() {
        let (t, clock) = tracker();
        t.register(PEER);

        assert!(!t.should_pulse(&PEER));
        clock.advance(Duration::from_millis(99));
        assert!(!t.should_pulse(&PEER));
        clock.advance(Duration::from_millis(1));
        assert!(t.should_pulse(&PEER));
        // Timer reset
        assert!(!t.should_pulse(&PEER));
    }

    #[test]
    fn test_missed_pulses() {
        let (t, clock) = tracker();
        t.register(PEER);

        for expected in 1..=3 {
            clock.advance(Duration::from_millis(100));
            assert!(t.should_pulse(&PEER));
            assert_eq!(t.missed_pulses(&PEER), expected);
        }

        t.on_receive(&PEER, 0);
        assert_eq!(t.missed_pulses(&PEER), 0);

        clock.advance(Duration::from_millis(100));
        assert!(t.should_pulse(&PEER));
        assert_eq!(t.missed_pulses(&PEER), 0);
    }

    #[test]
    fn test_liveness() {
        let (t, clock) = tracker();
        t.register(PEER);
        assert!(t.is_healthy(&PEER));

        clock.advance(Duration::from_millis(299));
        assert!(t.is_healthy(&PEER));
        clock.advance(Duration::from_millis(1));
        assert!(!t.is_healthy(&PEER));

        t.on_receive(&PEER, 0);
        assert!(t.is_healthy(&PEER));
        assert_eq!(t.silence(&PEER), Some(Duration::ZERO));
    }

    #[test]
    fn test_unknown_peer() {
        let (t, _) = tracker();
        assert!(!t.should_pulse(&PEER));
        assert!(!t.is_healthy(&PEER));
        assert!(t.pending_gaps(&PEER).is_empty());
        assert!(!t.cleanup(&PEER));
    }

    #[test]
    fn test_tracked_receive_ignores_removed_peer() {
        let (t, _) = tracker();
        assert!(t.on_receive_tracked(&PEER, 3).is_none());
        assert!(t.peers().is_empty());

        t.register(PEER);
        assert_eq!(t.on_receive_tracked(&PEER, 2), Some(vec![0, 1]));
        t.cleanup(&PEER);
        assert!(t.on_receive_tracked(&PEER, 4).is_none());
        assert!(t.expected_sequence(&PEER).is_none());
    }

    #[test]
    fn test_cleanup() {
        let (t, _) = tracker();
        t.on_receive(&PEER, 5);
        assert!(t.cleanup(&PEER));
        assert!(t.expected_sequence(&PEER).is_none());
        assert!(t.peers().is_empty());
    }
}
