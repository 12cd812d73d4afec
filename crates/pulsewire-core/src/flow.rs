//! AIMD congestion-aware flow control.
//!
//! Classic TCP-Reno style window management per peer:
//! - additive increase of `1 / cwnd` per acknowledged packet (one packet per
//!   RTT), suppressed while throttled
//! - multiplicative decrease to `max(MIN, floor(cwnd / 2))` on loss, followed
//!   by a throttle lasting `2 x srtt`
//! - smoothed RTT and bandwidth as EWMAs with alpha = 1/8
//!
//! Flow state is advisory. Every operation on an unknown peer is a no-op and
//! [`FlowController::can_send`] reports `true` for it, so missing state
//! degrades to unthrottled rather than failing the send path.

use crate::clock::Clock;
use crate::config::FlowConfig;
use crate::{PeerId, short_id};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// EWMA gain for smoothed RTT and bandwidth
const EWMA_ALPHA: f64 = 0.125;

/// Per-peer flow state
#[derive(Debug, Clone)]
struct FlowState {
    congestion_window: f64,
    bytes_in_flight: u64,
    packets_in_flight: u32,
    /// Bytes per second
    bandwidth_estimate: f64,
    rtt_min: Option<Duration>,
    rtt_smoothed: Duration,
    throttled_until: Option<Instant>,
    peer_window: Option<u16>,
}

impl FlowState {
    fn new(config: &FlowConfig) -> Self {
        Self {
            congestion_window: config.initial_window,
            bytes_in_flight: 0,
            packets_in_flight: 0,
            bandwidth_estimate: 0.0,
            rtt_min: None,
            rtt_smoothed: config.default_rtt(),
            throttled_until: None,
            peer_window: None,
        }
    }

    /// Clears an expired throttle and reports whether one is active.
    fn refresh_throttle(&mut self, now: Instant) -> bool {
        match self.throttled_until {
            Some(deadline) if now < deadline => true,
            Some(_) => {
                self.throttled_until = None;
                false
            }
            None => false,
        }
    }
}

/// Point-in-time view of a peer's flow state
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSnapshot {
    /// Congestion window in packets
    pub congestion_window: f64,
    /// Unacknowledged bytes
    pub bytes_in_flight: u64,
    /// Unacknowledged packets
    pub packets_in_flight: u32,
    /// Smoothed delivery rate (bytes/sec)
    pub bandwidth_estimate: f64,
    /// Smallest RTT observed
    pub rtt_min: Option<Duration>,
    /// Smoothed RTT
    pub rtt_smoothed: Duration,
    /// Whether a loss throttle is active
    pub throttled: bool,
    /// Receive window last advertised by the peer
    pub peer_window: Option<u16>,
}

/// Per-peer AIMD flow controller.
pub struct FlowController {
    peers: DashMap<PeerId, FlowState>,
    config: FlowConfig,
    clock: Arc<dyn Clock>,
}

impl FlowController {
    /// Create a flow controller.
    #[must_use]
    pub fn new(config: FlowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            peers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Initialize (or reset) flow state for a peer.
    pub fn init_flow(&self, peer_id: PeerId) {
        self.peers.insert(peer_id, FlowState::new(&self.config));
    }

    /// Whether another packet fits in the congestion window (and the peer's
    /// advertised window, if any).
    #[must_use]
    pub fn can_send(&self, peer_id: &PeerId) -> bool {
        let Some(state) = self.peers.get(peer_id) else {
            return true;
        };

        let in_flight = f64::from(state.packets_in_flight);
        let within_cwnd = in_flight < state.congestion_window;
        let within_peer = state
            .peer_window
            .is_none_or(|window| state.packets_in_flight < u32::from(window));
        within_cwnd && within_peer
    }

    /// Account for a sent packet.
    pub fn on_send(&self, peer_id: &PeerId, bytes: usize) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.bytes_in_flight = state.bytes_in_flight.saturating_add(bytes as u64);
            state.packets_in_flight = state.packets_in_flight.saturating_add(1);
        }
    }

    /// Account for an acknowledged packet and its RTT sample.
    pub fn on_ack(&self, peer_id: &PeerId, bytes: usize, rtt: Duration) {
        let now = self.clock.now();
        let Some(mut state) = self.peers.get_mut(peer_id) else {
            return;
        };

        state.bytes_in_flight = state.bytes_in_flight.saturating_sub(bytes as u64);
        state.packets_in_flight = state.packets_in_flight.saturating_sub(1);

        state.rtt_min = Some(state.rtt_min.map_or(rtt, |min| min.min(rtt)));

        let srtt = state.rtt_smoothed.as_secs_f64() * (1.0 - EWMA_ALPHA)
            + rtt.as_secs_f64() * EWMA_ALPHA;
        state.rtt_smoothed = Duration::from_secs_f64(srtt);

        if !rtt.is_zero() {
            let sample = bytes as f64 / rtt.as_secs_f64();
            state.bandwidth_estimate = if state.bandwidth_estimate == 0.0 {
                sample
            } else {
                state.bandwidth_estimate * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
            };
        }

        if !state.refresh_throttle(now) {
            let grown = state.congestion_window + 1.0 / state.congestion_window;
            state.congestion_window = grown.min(self.config.max_window);
        }
    }

    /// Multiplicative decrease and throttle for `2 x srtt`.
    pub fn on_loss(&self, peer_id: &PeerId) {
        let now = self.clock.now();
        let Some(mut state) = self.peers.get_mut(peer_id) else {
            return;
        };

        let previous = state.congestion_window;
        state.congestion_window = (previous / 2.0).floor().max(self.config.min_window);
        state.throttled_until = Some(now + state.rtt_smoothed * 2);

        tracing::debug!(
            "Loss on {}: cwnd {:.2} -> {:.2}, throttled for {:?}",
            short_id(peer_id),
            previous,
            state.congestion_window,
            state.rtt_smoothed * 2
        );
    }

    /// Record the receive window advertised by the peer.
    pub fn set_peer_window(&self, peer_id: &PeerId, window: u16) {
        if let Some(mut state) = self.peers.get_mut(peer_id) {
            state.peer_window = Some(window);
        }
    }

    /// Whether a loss throttle is currently active.
    #[must_use]
    pub fn is_throttled(&self, peer_id: &PeerId) -> bool {
        let now = self.clock.now();
        self.peers
            .get_mut(peer_id)
            .is_some_and(|mut state| state.refresh_throttle(now))
    }

    /// Estimated throughput in bytes per second:
    /// `cwnd x max_packet_size / srtt`.
    #[must_use]
    pub fn get_throughput(&self, peer_id: &PeerId) -> Option<f64> {
        self.peers.get(peer_id).map(|state| {
            let srtt = state.rtt_smoothed.as_secs_f64();
            if srtt > 0.0 {
                state.congestion_window * self.config.max_packet_size as f64 / srtt
            } else {
                0.0
            }
        })
    }

    /// Current flow state for the peer.
    #[must_use]
    pub fn snapshot(&self, peer_id: &PeerId) -> Option<FlowSnapshot> {
        let now = self.clock.now();
        self.peers.get_mut(peer_id).map(|mut state| {
            let throttled = state.refresh_throttle(now);
            FlowSnapshot {
                congestion_window: state.congestion_window,
                bytes_in_flight: state.bytes_in_flight,
                packets_in_flight: state.packets_in_flight,
                bandwidth_estimate: state.bandwidth_estimate,
                rtt_min: state.rtt_min,
                rtt_smoothed: state.rtt_smoothed,
                throttled,
                peer_window: state.peer_window,
            }
        })
    }

    /// Drop flow state for the peer.
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        self.peers.remove(peer_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const PEER: PeerId = [3u8; 32];

    fn controller() -> (FlowController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let fc = FlowController::new(FlowConfig::default(), clock.clone());
        fc.init_flow(PEER);
        (fc, clock)
    }

    fn cwnd(fc: &FlowController) -> f64 {
        fc.snapshot(&PEER).unwrap().congestion_window
    }

    #[test]
    fn test_initial_state() {
        let (fc, _) = controller();
        let s = fc.snapshot(&PEER).unwrap();

        assert_eq!(s.congestion_window, 10.0);
        assert_eq!(s.rtt_smoothed, Duration::from_millis(100));
        assert_eq!(s.packets_in_flight, 0);
        assert!(!s.throttled);
        assert!(s.rtt_min.is_none());
    }

    #[test]
    fn test_can_send_respects_window() {
        let (fc, _) = controller();
        for _ in 0..10 {
            assert!(fc.can_send(&PEER));
            fc.on_send(&PEER, 1000);
        }
        assert!(!fc.can_send(&PEER));

        fc.on_ack(&PEER, 1000, Duration::from_millis(100));
        assert!(fc.can_send(&PEER));
    }

    #[test]
    fn test_peer_window_limits_sending() {
        let (fc, _) = controller();
        fc.set_peer_window(&PEER, 2);
        fc.on_send(&PEER, 100);
        fc.on_send(&PEER, 100);
        assert!(!fc.can_send(&PEER));
    }

    #[test]
    fn test_ack_updates_rtt_and_bandwidth() {
        let (fc, _) = controller();
        fc.on_send(&PEER, 1000);
        fc.on_ack(&PEER, 1000, Duration::from_millis(20));

        let s = fc.snapshot(&PEER).unwrap();
        // 100 * 0.875 + 20 * 0.125 = 90 ms
        assert!((s.rtt_smoothed.as_secs_f64() - 0.090).abs() < 1e-9);
        assert_eq!(s.rtt_min, Some(Duration::from_millis(20)));
        assert!((s.bandwidth_estimate - 50_000.0).abs() < 1e-6);
        assert_eq!(s.bytes_in_flight, 0);
        assert!((s.congestion_window - 10.1).abs() < 1e-9);
    }

    #[test]
    fn test_in_flight_floors_at_zero() {
        let (fc, _) = controller();
        fc.on_ack(&PEER, 5000, Duration::from_millis(10));
        let s = fc.snapshot(&PEER).unwrap();
        assert_eq!(s.bytes_in_flight, 0);
        assert_eq!(s.packets_in_flight, 0);
    }

    #[test]
    fn test_loss_halves_window() {
        let (fc, _) = controller();
        fc.on_loss(&PEER);
        assert_eq!(cwnd(&fc), 5.0);
        assert!(fc.is_throttled(&PEER));
    }

    #[test]
    fn test_loss_floors_at_min() {
        let (fc, _) = controller();
        for _ in 0..10 {
            fc.on_loss(&PEER);
        }
        assert_eq!(cwnd(&fc), 2.0);
    }

    #[test]
    fn test_throttle_suppresses_growth_until_deadline() {
        let (fc, clock) = controller();
        fc.on_loss(&PEER);
        let after_loss = cwnd(&fc);

        // srtt = 100 ms, throttle lasts 200 ms
        clock.advance(Duration::from_millis(150));
        fc.on_ack(&PEER, 1000, Duration::from_millis(100));
        assert_eq!(cwnd(&fc), after_loss);

        clock.advance(Duration::from_millis(50));
        assert!(!fc.is_throttled(&PEER));
        fc.on_ack(&PEER, 1000, Duration::from_millis(100));
        assert!(cwnd(&fc) > after_loss);
    }

    #[test]
    fn test_window_capped_at_max() {
        let clock = Arc::new(ManualClock::default());
        let config = FlowConfig {
            initial_window: 1023.9995,
            ..FlowConfig::default()
        };
        let fc = FlowController::new(config, clock);
        fc.init_flow(PEER);

        for _ in 0..10 {
            fc.on_ack(&PEER, 100, Duration::from_millis(10));
        }
        assert_eq!(cwnd(&fc), 1024.0);
    }

    #[test]
    fn test_throughput() {
        let (fc, _) = controller();
        // 10 packets * 1200 bytes / 0.1 s
        let throughput = fc.get_throughput(&PEER).unwrap();
        assert!((throughput - 120_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_peer_is_noop() {
        let clock = Arc::new(ManualClock::default());
        let fc = FlowController::new(FlowConfig::default(), clock);
        let stranger = [9u8; 32];

        assert!(fc.can_send(&stranger));
        fc.on_send(&stranger, 100);
        fc.on_ack(&stranger, 100, Duration::from_millis(5));
        fc.on_loss(&stranger);
        fc.set_peer_window(&stranger, 1);
        assert!(!fc.is_throttled(&stranger));
        assert!(fc.get_throughput(&stranger).is_none());
        assert!(fc.snapshot(&stranger).is_none());
        assert!(fc.can_send(&stranger));
    }

    #[test]
    fn test_remove() {
        let (fc, _) = controller();
        assert!(fc.remove(&PEER));
        assert!(!fc.remove(&PEER));
    }
}
