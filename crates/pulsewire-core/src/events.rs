//! Peer lifecycle events.
//!
//! [`crate::ProtocolCore::subscribe`] hands out a broadcast receiver; callers
//! drain it at their own pace. A lagging receiver loses the oldest events,
//! never blocks the core.

use crate::PeerId;
use crate::metrics::SecurityEventType;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event about a peer's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Session established (route id included)
    Established {
        /// Peer
        peer_id: PeerId,
        /// Route id of the new session
        route_id: u64,
    },
    /// Session torn down locally or by a CLOSE from the peer
    Closed {
        /// Peer
        peer_id: PeerId,
        /// Whether the peer initiated the close
        remote: bool,
    },
    /// Session crossed its rotation threshold
    RotationDue {
        /// Peer
        peer_id: PeerId,
    },
    /// Peer silent beyond the liveness timeout
    Unhealthy {
        /// Peer
        peer_id: PeerId,
        /// Consecutive pulses without a receipt
        missed_pulses: u32,
    },
    /// A datagram for this peer was rejected for security reasons
    SecurityFailure {
        /// Peer
        peer_id: PeerId,
        /// What was rejected
        kind: SecurityEventType,
        /// Sequence carried by the rejected datagram
        sequence: u32,
    },
}

impl PeerEvent {
    /// Peer the event concerns.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Established { peer_id, .. }
            | Self::Closed { peer_id, .. }
            | Self::RotationDue { peer_id }
            | Self::Unhealthy { peer_id, .. }
            | Self::SecurityFailure { peer_id, .. } => peer_id,
        }
    }
}
