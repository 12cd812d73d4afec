//! # PULSEWIRE Core
//!
//! Core protocol implementation for PULSEWIRE, a puncturable-key secure
//! datagram transport for peer-to-peer messaging.
//!
//! This crate provides:
//! - Puncturable per-peer session keys (replay protection without round trips)
//! - Fixed 16-byte datagram framing with authenticated payloads (0-RTT)
//! - Pulse/gap tracking for keep-alive and retransmission requests
//! - AIMD congestion-aware flow control
//! - Dual-layer envelopes: cleartext manifest for routers, encrypted content
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       ProtocolCore                               │
//! │   (routing table, retransmission queue, events, metrics)        │
//! ├──────────────────┬──────────────────┬───────────────────────────┤
//! │   PulseTracker   │  FlowController  │        Envelope           │
//! │  (gaps, liveness)│  (AIMD, RTT)     │  (manifest / hidden)      │
//! ├──────────────────┴──────────────────┴───────────────────────────┤
//! │                    Datagram header codec                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   Puncturable KeyStore                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core never opens sockets. It produces datagrams for an external
//! transport to send and consumes datagrams that transport receives.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod clock;
pub mod config;
pub mod datagram;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod events;
pub mod flow;
pub mod keystore;
pub mod metrics;
pub mod persist;
pub mod protocol;
pub mod pulse;
pub mod routing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProtocolConfig;
pub use datagram::{DatagramHeader, PacketFlags, PacketType};
pub use envelope::{Envelope, Hidden, Manifest, Priority};
pub use error::{ConfigError, EnvelopeError, Error, FrameError, KeyStoreError, PacketError};
pub use events::PeerEvent;
pub use flow::{FlowController, FlowSnapshot};
pub use keystore::{Direction, KeyStore, SequenceKey, SessionKeyRecord};
pub use metrics::{SecurityEventType, SecurityMetrics, SecurityMetricsSnapshot};
pub use persist::{PassphraseProtector, SecretProtector, SessionSnapshot};
pub use protocol::{PacketEvent, ProtocolCore, Received, TimerActions};
pub use pulse::PulseTracker;
pub use routing::RoutingTable;

/// Stable identifier of a remote peer
pub type PeerId = [u8; 32];

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening every datagram ("PW")
pub const MAGIC: [u8; 2] = [0x50, 0x57];

/// Fixed datagram header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Route identifier prefix on every payload
pub const ROUTE_ID_SIZE: usize = 8;

/// AEAD authentication tag size
pub const AUTH_TAG_SIZE: usize = pulsewire_crypto::aead::TAG_SIZE;

/// Short hex rendering of a peer id for logs.
pub(crate) fn short_id(peer_id: &PeerId) -> String {
    hex::encode(&peer_id[..8])
}
