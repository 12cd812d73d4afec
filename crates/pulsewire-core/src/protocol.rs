//! Protocol core: sessions, framing, routing and retransmission.
//!
//! A [`ProtocolCore`] owns every piece of per-peer state (key records, route
//! table, pulse and flow state, retransmission queue). It is an ordinary
//! value: create as many as needed, drop it to tear everything down.
//!
//! ## Payload Layout
//!
//! ```text
//! +----------------+-----------------+---------------------------------+
//! | Header (16B)   | Route id (8B)   | Sealed body                     |
//! +----------------+-----------------+---------------------------------+
//! ```
//!
//! The sealed body is either a key-store sealed control/data body (AAD binds
//! magic, version, type, flags, timestamp and route id) or, with the
//! `ENVELOPE` flag, a serialized [`Envelope`] whose AAD is its manifest
//! followed by the same header binding. The header sequence must match the
//! sealed sequence.
//!
//! ## Control Bodies (before sealing)
//!
//! | Type  | Body |
//! |-------|------|
//! | ACK   | acked sequence (4B) + echoed timestamp (4B) |
//! | NACK  | count (2B) + count x sequence (4B each) |
//! | PULSE | lowest retransmittable sequence (4B) |
//! | FLOW  | receive window (2B) |
//! | CLOSE | empty |
//!
//! Every packet consumes a send sequence, so every packet is replay
//! protected.

use crate::clock::{Clock, SystemClock, wire_elapsed};
use crate::config::ProtocolConfig;
use crate::datagram::{self, DatagramHeader, PacketFlags, PacketType};
use crate::envelope::{self, Envelope, Hidden, Manifest, Priority};
use crate::error::{ConfigError, Error, FrameError, KeyStoreError, PacketError};
use crate::events::{EVENT_CHANNEL_CAPACITY, PeerEvent};
use crate::flow::FlowController;
use crate::keystore::{KeyStore, SEALED_OVERHEAD, sealed_sequence};
use crate::metrics::{SecurityEventType, SecurityMetrics, SecurityMetricsSnapshot};
use crate::persist::{SecretProtector, SessionSnapshot};
use crate::pulse::PulseTracker;
use crate::routing::{RoutingTable, extract_route_id};
use crate::{MAGIC, PROTOCOL_VERSION, PeerId, ROUTE_ID_SIZE, short_id};
use dashmap::{DashMap, DashSet};
use pulsewire_crypto::signatures::{SignedAgreementKey, VerifyingKey};
use pulsewire_crypto::x25519::{PrivateKey, PublicKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Most sequences a single NACK carries
pub const MAX_NACK_ENTRIES: usize = 256;

/// Largest body that still fits the 16-bit payload length once sealed
const MAX_BODY_SIZE: usize = u16::MAX as usize - ROUTE_ID_SIZE - SEALED_OVERHEAD;

/// What a processed datagram carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketEvent {
    /// Application data
    Data(Vec<u8>),
    /// Opened envelope
    Envelope {
        /// Cleartext manifest
        manifest: Manifest,
        /// Decrypted content
        hidden: Hidden,
    },
    /// Acknowledgment
    Ack {
        /// Sequence acknowledged by the peer
        acked_sequence: u32,
        /// Round trip measured from the echoed timestamp
        rtt: Duration,
    },
    /// Retransmission request
    Nack {
        /// Sequences the peer reported missing
        requested: Vec<u32>,
        /// Stored datagrams to send again (flagged RETRANSMIT)
        retransmit: Vec<Vec<u8>>,
    },
    /// Keep-alive
    Pulse,
    /// Receive-window advertisement
    Flow {
        /// Advertised window in packets
        window: u16,
    },
    /// Peer closed the session; local state is already gone
    Close,
}

/// A successfully processed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Sending peer
    pub peer_id: PeerId,
    /// Sequence of the datagram
    pub sequence: u32,
    /// Sender's truncated timestamp (echo it in the ACK)
    pub timestamp: u32,
    /// Header flags
    pub flags: PacketFlags,
    /// Decoded content
    pub event: PacketEvent,
    /// Gaps this datagram opened (sequences to NACK)
    pub missing: Vec<u32>,
}

/// Timer work found by [`ProtocolCore::poll_timers`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerActions {
    /// Peers that should be sent a PULSE now
    pub pulse_due: Vec<PeerId>,
    /// Peers that just crossed the liveness timeout
    pub unhealthy: Vec<PeerId>,
}

#[derive(Debug, Clone)]
struct PendingPacket {
    datagram: Vec<u8>,
    size: usize,
}

/// Sent DATA packets awaiting acknowledgment, oldest evicted first.
#[derive(Debug, Default)]
struct PendingQueue {
    packets: BTreeMap<u32, PendingPacket>,
}

impl PendingQueue {
    fn insert(&mut self, sequence: u32, packet: PendingPacket, capacity: usize) {
        self.packets.insert(sequence, packet);
        while self.packets.len() > capacity {
            self.packets.pop_first();
        }
    }

    fn floor(&self) -> Option<u32> {
        self.packets.keys().next().copied()
    }
}

/// Instance-owned PULSEWIRE protocol state.
pub struct ProtocolCore {
    local_id: PeerId,
    config: ProtocolConfig,
    clock: Arc<dyn Clock>,
    keystore: KeyStore,
    routing: RoutingTable,
    pulse: PulseTracker,
    flow: FlowController,
    pending: DashMap<PeerId, PendingQueue>,
    rotation_notified: DashSet<PeerId>,
    unhealthy: DashSet<PeerId>,
    metrics: SecurityMetrics,
    events: broadcast::Sender<PeerEvent>,
}

impl ProtocolCore {
    /// Create a core using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration fails validation.
    pub fn new(local_id: PeerId, config: ProtocolConfig) -> Result<Self, ConfigError> {
        Self::with_clock(local_id, config, Arc::new(SystemClock))
    }

    /// Create a core with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration fails validation.
    pub fn with_clock(
        local_id: PeerId,
        config: ProtocolConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            local_id,
            keystore: KeyStore::new(config.keystore.clone(), Arc::clone(&clock)),
            routing: RoutingTable::new(),
            pulse: PulseTracker::new(config.pulse.clone(), Arc::clone(&clock)),
            flow: FlowController::new(config.flow.clone(), Arc::clone(&clock)),
            pending: DashMap::new(),
            rotation_notified: DashSet::new(),
            unhealthy: DashSet::new(),
            metrics: SecurityMetrics::new(),
            events,
            config,
            clock,
        })
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Establish a session with `peer_id`. No round trip: data may be sent
    /// immediately. Returns the session's route id.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyAgreement`] for an invalid peer key.
    pub fn create_connection(
        &self,
        local_private: &PrivateKey,
        peer_id: PeerId,
        peer_public: &PublicKey,
    ) -> Result<u64, Error> {
        let previous_route = self.keystore.route_id(&peer_id);
        let route_id = self.keystore.establish(peer_id, local_private, peer_public)?;
        self.install_session(peer_id, previous_route, route_id);
        Ok(route_id)
    }

    /// [`ProtocolCore::create_connection`] with the peer's agreement key
    /// authenticated by its identity key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyAgreement`] on a bad signature or key.
    pub fn create_connection_signed(
        &self,
        local_private: &PrivateKey,
        peer_id: PeerId,
        signed_key: &SignedAgreementKey,
        peer_identity: &VerifyingKey,
    ) -> Result<u64, Error> {
        let previous_route = self.keystore.route_id(&peer_id);
        let route_id =
            self.keystore
                .establish_signed(peer_id, local_private, signed_key, peer_identity)?;
        self.install_session(peer_id, previous_route, route_id);
        Ok(route_id)
    }

    /// Resume a session from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Persistence`] if the snapshot cannot be restored.
    pub fn resume_session(
        &self,
        snapshot: &SessionSnapshot,
        protector: &dyn SecretProtector,
    ) -> Result<u64, Error> {
        let previous_route = self.keystore.route_id(&snapshot.peer_id);
        let route_id = self.keystore.import(snapshot, protector)?;
        self.install_session(snapshot.peer_id, previous_route, route_id);
        Ok(route_id)
    }

    /// Snapshot a session for later [`ProtocolCore::resume_session`].
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`] or [`KeyStoreError::Persistence`].
    pub fn export_session(
        &self,
        peer_id: &PeerId,
        protector: &dyn SecretProtector,
    ) -> Result<SessionSnapshot, Error> {
        Ok(self.keystore.export(peer_id, protector)?)
    }

    fn install_session(&self, peer_id: PeerId, previous_route: Option<u64>, route_id: u64) {
        // The route id is derived from the master secret: same route, same session
        if previous_route == Some(route_id) {
            tracing::debug!("Session with {} unchanged", short_id(&peer_id));
            return;
        }
        if let Some(previous) = previous_route.filter(|r| *r != route_id) {
            self.routing.remove_route(previous);
        }
        self.routing.add_route(route_id, peer_id);
        self.pulse.register(peer_id);
        self.flow.init_flow(peer_id);
        self.pending.insert(peer_id, PendingQueue::default());
        self.rotation_notified.remove(&peer_id);
        self.unhealthy.remove(&peer_id);

        tracing::info!(
            "Session established with {} (route {:016x})",
            short_id(&peer_id),
            route_id
        );
        self.emit(PeerEvent::Established { peer_id, route_id });
    }

    /// Tear down the session locally: keys zeroized, all peer state dropped.
    /// Returns whether a session existed.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        self.teardown(peer_id, false)
    }

    fn teardown(&self, peer_id: &PeerId, remote: bool) -> bool {
        // Unroute first so no new datagram reaches the record being destroyed
        if let Some(route_id) = self.keystore.route_id(peer_id) {
            self.routing.remove_route(route_id);
        }
        let existed = self.keystore.destroy(peer_id);
        self.pulse.cleanup(peer_id);
        self.flow.remove(peer_id);
        self.pending.remove(peer_id);
        self.rotation_notified.remove(peer_id);
        self.unhealthy.remove(peer_id);

        if existed {
            tracing::info!(
                "Session with {} closed ({})",
                short_id(peer_id),
                if remote { "remote" } else { "local" }
            );
            self.emit(PeerEvent::Closed {
                peer_id: *peer_id,
                remote,
            });
        }
        existed
    }

    /// Whether the session should be rotated (re-established with fresh keys).
    #[must_use]
    pub fn needs_rotation(&self, peer_id: &PeerId) -> bool {
        self.keystore.needs_rotation(peer_id)
    }

    /// Whether a session exists for the peer.
    #[must_use]
    pub fn has_session(&self, peer_id: &PeerId) -> bool {
        self.keystore.has_session(peer_id)
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Build an encrypted DATA datagram and queue it for retransmission.
    ///
    /// Flow control is advisory: check [`ProtocolCore::can_send`] first.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`] or [`FrameError::PayloadTooLarge`].
    pub fn create_data_packet(&self, peer_id: &PeerId, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let (datagram, sequence) =
            self.seal_packet(peer_id, PacketType::Data, PacketFlags::new(), payload)?;
        self.track_sent(peer_id, sequence, &datagram);
        Ok(datagram)
    }

    /// Seal `hidden` into an envelope from this node to `recipient_id` and
    /// frame it as a DATA datagram with the `ENVELOPE` flag.
    ///
    /// # Errors
    ///
    /// Returns an envelope error (no session, serialization) or
    /// [`FrameError::PayloadTooLarge`].
    pub fn send_envelope(
        &self,
        recipient_id: &PeerId,
        hidden: &Hidden,
        priority: Priority,
    ) -> Result<Vec<u8>, Error> {
        let route_id = self.route_of(recipient_id)?;
        let timestamp = self.clock.wire_timestamp();
        let flags = PacketFlags::new().with_envelope();
        let envelope = envelope::seal_with_aad(
            &self.keystore,
            self.local_id,
            *recipient_id,
            hidden,
            priority,
            self.clock.unix_millis(),
            &packet_aad(PacketType::Data, flags, timestamp, route_id),
        )?;
        let sequence = envelope
            .sequence()
            .ok_or(KeyStoreError::MalformedCiphertext)?;

        let envelope_bytes = envelope.to_bytes();
        let mut payload = Vec::with_capacity(ROUTE_ID_SIZE + envelope_bytes.len());
        payload.extend_from_slice(&route_id.to_be_bytes());
        payload.extend_from_slice(&envelope_bytes);

        let header = DatagramHeader::new(PacketType::Data, sequence, timestamp, flags);
        let datagram = datagram::encode(&header, &payload)?;
        self.track_sent(recipient_id, sequence, &datagram);
        Ok(datagram)
    }

    /// Build an ACK for `acked_sequence`, echoing the timestamp it carried.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`].
    pub fn create_ack_packet(
        &self,
        peer_id: &PeerId,
        acked_sequence: u32,
        echo_timestamp: u32,
    ) -> Result<Vec<u8>, Error> {
        let mut body = [0u8; 8];
        body[..4].copy_from_slice(&acked_sequence.to_be_bytes());
        body[4..].copy_from_slice(&echo_timestamp.to_be_bytes());
        Ok(self
            .seal_packet(peer_id, PacketType::Ack, PacketFlags::new(), &body)?
            .0)
    }

    /// Build a NACK requesting up to [`MAX_NACK_ENTRIES`] missing sequences.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`].
    pub fn create_nack_packet(&self, peer_id: &PeerId, missing: &[u32]) -> Result<Vec<u8>, Error> {
        let missing = &missing[..missing.len().min(MAX_NACK_ENTRIES)];
        let mut body = Vec::with_capacity(2 + missing.len() * 4);
        body.extend_from_slice(&(missing.len() as u16).to_be_bytes());
        for sequence in missing {
            body.extend_from_slice(&sequence.to_be_bytes());
        }
        Ok(self
            .seal_packet(peer_id, PacketType::Nack, PacketFlags::new(), &body)?
            .0)
    }

    /// Build a keep-alive carrying the lowest sequence still retransmittable.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`].
    pub fn create_pulse_packet(&self, peer_id: &PeerId) -> Result<Vec<u8>, Error> {
        let pending_floor = self.pending.get(peer_id).and_then(|queue| queue.floor());
        let floor = match pending_floor {
            Some(floor) => floor,
            None => self
                .keystore
                .inspect(peer_id, |record| record.next_send_sequence())
                .map_or(0, |next| u32::try_from(next).unwrap_or(u32::MAX)),
        };
        Ok(self
            .seal_packet(peer_id, PacketType::Pulse, PacketFlags::new(), &floor.to_be_bytes())?
            .0)
    }

    /// Build a receive-window advertisement.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`].
    pub fn create_flow_packet(&self, peer_id: &PeerId, window: u16) -> Result<Vec<u8>, Error> {
        Ok(self
            .seal_packet(peer_id, PacketType::Flow, PacketFlags::new(), &window.to_be_bytes())?
            .0)
    }

    /// Build a CLOSE and tear down the local session.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`].
    pub fn create_close_packet(&self, peer_id: &PeerId) -> Result<Vec<u8>, Error> {
        let (datagram, _) = self.seal_packet(peer_id, PacketType::Close, PacketFlags::new(), &[])?;
        self.teardown(peer_id, false);
        Ok(datagram)
    }

    /// Whether the flow controller allows another packet to the peer.
    #[must_use]
    pub fn can_send(&self, peer_id: &PeerId) -> bool {
        self.flow.can_send(peer_id)
    }

    fn route_of(&self, peer_id: &PeerId) -> Result<u64, KeyStoreError> {
        self.keystore
            .route_id(peer_id)
            .ok_or_else(|| KeyStoreError::NoSession(short_id(peer_id)))
    }

    fn seal_packet(
        &self,
        peer_id: &PeerId,
        packet_type: PacketType,
        flags: PacketFlags,
        body: &[u8],
    ) -> Result<(Vec<u8>, u32), Error> {
        if body.len() > MAX_BODY_SIZE {
            return Err(FrameError::PayloadTooLarge(body.len()).into());
        }

        let route_id = self.route_of(peer_id)?;
        let timestamp = self.clock.wire_timestamp();
        let aad = packet_aad(packet_type, flags, timestamp, route_id);
        let (sealed, sequence) = self.keystore.encrypt_with_aad(peer_id, body, &aad)?;

        let mut payload = Vec::with_capacity(ROUTE_ID_SIZE + sealed.len());
        payload.extend_from_slice(&route_id.to_be_bytes());
        payload.extend_from_slice(&sealed);

        let header = DatagramHeader::new(packet_type, sequence, timestamp, flags);
        let datagram = datagram::encode(&header, &payload)?;

        tracing::trace!(
            "Sending {} seq={} to {} ({} bytes)",
            packet_type,
            sequence,
            short_id(peer_id),
            datagram.len()
        );
        self.notify_rotation(peer_id);
        Ok((datagram, sequence))
    }

    fn track_sent(&self, peer_id: &PeerId, sequence: u32, datagram: &[u8]) {
        if let Some(mut queue) = self.pending.get_mut(peer_id) {
            queue.insert(
                sequence,
                PendingPacket {
                    datagram: datagram.to_vec(),
                    size: datagram.len(),
                },
                self.config.datagram.max_pending_packets,
            );
        }
        self.flow.on_send(peer_id, datagram.len());
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Authenticate, decrypt and dispatch one received datagram.
    ///
    /// Never panics on hostile input: every failure is returned as a
    /// [`PacketError`] and counted in [`ProtocolCore::security_metrics`].
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] describing why the datagram was dropped.
    pub fn process_packet(&self, bytes: &[u8]) -> Result<Received, PacketError> {
        let (header, payload) = datagram::parse(bytes).inspect_err(|e| {
            self.metrics.record(SecurityEventType::Malformed);
            tracing::trace!("Dropping malformed datagram: {}", e);
        })?;

        let Some(route_id) = extract_route_id(payload) else {
            self.metrics.record(SecurityEventType::Malformed);
            return Err(PacketError::MissingRoute);
        };
        let Some(peer_id) = self.routing.lookup(route_id) else {
            self.metrics.record(SecurityEventType::UnknownRoute);
            tracing::debug!("Dropping datagram for unknown route {:016x}", route_id);
            return Err(PacketError::UnknownRoute(route_id));
        };
        let body = &payload[ROUTE_ID_SIZE..];

        let opened = if header.flags.is_envelope() && header.packet_type == PacketType::Data {
            self.open_envelope(&peer_id, &header, route_id, body)
        } else {
            self.open_sealed(&peer_id, &header, route_id, body)
                .map(Opened::Plain)
        };
        let opened = opened.inspect_err(|e| self.record_rejection(&peer_id, header.sequence, e))?;

        // Authenticated from here on. A session torn down meanwhile stays gone.
        let missing = self
            .pulse
            .on_receive_tracked(&peer_id, header.sequence)
            .unwrap_or_default();
        self.unhealthy.remove(&peer_id);
        if header.flags.is_retransmit() {
            tracing::trace!("Retransmitted seq={} from {}", header.sequence, short_id(&peer_id));
        }

        let event = match opened {
            Opened::Envelope { manifest, hidden } => PacketEvent::Envelope { manifest, hidden },
            Opened::Plain(plaintext) => self.dispatch(&peer_id, &header, plaintext)?,
        };

        if event != PacketEvent::Close {
            self.notify_rotation(&peer_id);
        }

        Ok(Received {
            peer_id,
            sequence: header.sequence,
            timestamp: header.timestamp,
            flags: header.flags,
            event,
            missing,
        })
    }

    fn open_sealed(
        &self,
        peer_id: &PeerId,
        header: &DatagramHeader,
        route_id: u64,
        body: &[u8],
    ) -> Result<Vec<u8>, PacketError> {
        let sealed = sealed_sequence(body).ok_or(KeyStoreError::MalformedCiphertext)?;
        if sealed != header.sequence {
            return Err(PacketError::SequenceMismatch {
                header: header.sequence,
                sealed,
            });
        }

        let aad = packet_aad(header.packet_type, header.flags, header.timestamp, route_id);
        Ok(self.keystore.decrypt_with_aad(peer_id, body, &aad)?)
    }

    fn open_envelope(
        &self,
        peer_id: &PeerId,
        header: &DatagramHeader,
        route_id: u64,
        body: &[u8],
    ) -> Result<Opened, PacketError> {
        let envelope = Envelope::from_bytes(body)?;

        if envelope.manifest.sender_id != *peer_id {
            return Err(PacketError::InvalidBody("envelope sender"));
        }
        if envelope.manifest.recipient_id != self.local_id {
            return Err(PacketError::InvalidBody("envelope recipient"));
        }
        let sealed = envelope.sequence().ok_or(KeyStoreError::MalformedCiphertext)?;
        if sealed != header.sequence {
            return Err(PacketError::SequenceMismatch {
                header: header.sequence,
                sealed,
            });
        }

        let aad = packet_aad(header.packet_type, header.flags, header.timestamp, route_id);
        let hidden = envelope::open_with_aad(&self.keystore, &envelope, &aad)?;
        Ok(Opened::Envelope {
            manifest: envelope.manifest,
            hidden,
        })
    }

    fn dispatch(
        &self,
        peer_id: &PeerId,
        header: &DatagramHeader,
        body: Vec<u8>,
    ) -> Result<PacketEvent, PacketError> {
        let event = match header.packet_type {
            PacketType::Data => PacketEvent::Data(body),
            PacketType::Ack => {
                let (acked_sequence, echo) = match body.as_slice() {
                    [a0, a1, a2, a3, e0, e1, e2, e3] => (
                        u32::from_be_bytes([*a0, *a1, *a2, *a3]),
                        u32::from_be_bytes([*e0, *e1, *e2, *e3]),
                    ),
                    _ => return Err(self.invalid_body("ack")),
                };
                let rtt = wire_elapsed(self.clock.wire_timestamp(), echo);
                let acked = self
                    .pending
                    .get_mut(peer_id)
                    .and_then(|mut queue| queue.packets.remove(&acked_sequence));
                if let Some(packet) = acked {
                    self.flow.on_ack(peer_id, packet.size, rtt);
                }
                PacketEvent::Ack {
                    acked_sequence,
                    rtt,
                }
            }
            PacketType::Nack => {
                let requested = parse_nack(&body).ok_or_else(|| self.invalid_body("nack"))?;
                let retransmit: Vec<Vec<u8>> = self
                    .pending
                    .get(peer_id)
                    .map(|queue| {
                        requested
                            .iter()
                            .filter_map(|seq| queue.packets.get(seq))
                            .map(|packet| mark_retransmit(&packet.datagram))
                            .collect()
                    })
                    .unwrap_or_default();
                if !requested.is_empty() {
                    self.flow.on_loss(peer_id);
                }
                tracing::debug!(
                    "NACK from {}: {} requested, {} retransmittable",
                    short_id(peer_id),
                    requested.len(),
                    retransmit.len()
                );
                PacketEvent::Nack {
                    requested,
                    retransmit,
                }
            }
            PacketType::Pulse => {
                let floor: [u8; 4] = body
                    .as_slice()
                    .try_into()
                    .map_err(|_| self.invalid_body("pulse"))?;
                self.pulse
                    .discard_gaps_below(peer_id, u32::from_be_bytes(floor));
                PacketEvent::Pulse
            }
            PacketType::Flow => {
                let window: [u8; 2] = body
                    .as_slice()
                    .try_into()
                    .map_err(|_| self.invalid_body("flow"))?;
                let window = u16::from_be_bytes(window);
                self.flow.set_peer_window(peer_id, window);
                PacketEvent::Flow { window }
            }
            PacketType::Close => {
                self.teardown(peer_id, true);
                PacketEvent::Close
            }
        };
        Ok(event)
    }

    fn invalid_body(&self, kind: &'static str) -> PacketError {
        self.metrics.record(SecurityEventType::Malformed);
        PacketError::InvalidBody(kind)
    }

    fn record_rejection(&self, peer_id: &PeerId, sequence: u32, error: &PacketError) {
        let key_store_error = match error {
            PacketError::KeyStore(e) => Some(e),
            PacketError::Envelope(e) => e.key_store_error(),
            _ => None,
        };

        let kind = match key_store_error {
            Some(KeyStoreError::ReplayDetected { .. }) => SecurityEventType::Replay,
            Some(KeyStoreError::AuthenticationFailed { .. }) => {
                SecurityEventType::AuthenticationFailure
            }
            _ => SecurityEventType::Malformed,
        };
        self.metrics.record(kind);

        match kind {
            SecurityEventType::AuthenticationFailure => tracing::warn!(
                "Authentication failed for seq={} from {}",
                sequence,
                short_id(peer_id)
            ),
            _ => tracing::debug!(
                "Dropping seq={} from {}: {}",
                sequence,
                short_id(peer_id),
                error
            ),
        }

        if kind != SecurityEventType::Malformed {
            self.emit(PeerEvent::SecurityFailure {
                peer_id: *peer_id,
                kind,
                sequence,
            });
        }
    }

    // ========================================================================
    // Timers, events, metrics
    // ========================================================================

    /// Check keep-alive and liveness deadlines for every peer.
    ///
    /// Emits [`PeerEvent::Unhealthy`] once per silence period.
    pub fn poll_timers(&self) -> TimerActions {
        let mut actions = TimerActions::default();
        for peer_id in self.pulse.peers() {
            if self.pulse.should_pulse(&peer_id) {
                actions.pulse_due.push(peer_id);
            }
            if !self.pulse.is_healthy(&peer_id) && self.unhealthy.insert(peer_id) {
                let missed_pulses = self.pulse.missed_pulses(&peer_id);
                tracing::warn!(
                    "Peer {} unhealthy ({} missed pulses)",
                    short_id(&peer_id),
                    missed_pulses
                );
                self.emit(PeerEvent::Unhealthy {
                    peer_id,
                    missed_pulses,
                });
                actions.unhealthy.push(peer_id);
            }
        }
        actions
    }

    /// Subscribe to peer events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Security counters.
    #[must_use]
    pub fn security_metrics(&self) -> SecurityMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Datagrams held for retransmission to the peer.
    #[must_use]
    pub fn pending_count(&self, peer_id: &PeerId) -> usize {
        self.pending.get(peer_id).map_or(0, |queue| queue.packets.len())
    }

    /// This node's identifier.
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Key store.
    #[must_use]
    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Pulse tracker.
    #[must_use]
    pub fn pulse(&self) -> &PulseTracker {
        &self.pulse
    }

    /// Flow controller.
    #[must_use]
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Routing table.
    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    fn notify_rotation(&self, peer_id: &PeerId) {
        if self.keystore.needs_rotation(peer_id) && self.rotation_notified.insert(*peer_id) {
            tracing::info!("Session with {} due for rotation", short_id(peer_id));
            self.emit(PeerEvent::RotationDue { peer_id: *peer_id });
        }
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

enum Opened {
    Plain(Vec<u8>),
    Envelope { manifest: Manifest, hidden: Hidden },
}

/// Associated data binding the header fields (except the sequence, which is
/// bound by the per-sequence key) and the route id.
///
/// The RETRANSMIT bit is excluded so a stored datagram can be re-flagged
/// without re-encryption.
fn packet_aad(packet_type: PacketType, flags: PacketFlags, timestamp: u32, route_id: u64) -> [u8; 18] {
    let mut aad = [0u8; 18];
    aad[0..2].copy_from_slice(&MAGIC);
    aad[2] = PROTOCOL_VERSION;
    aad[3] = packet_type as u8;
    aad[4..6].copy_from_slice(&(flags.bits() & !PacketFlags::RETRANSMIT).to_be_bytes());
    aad[6..10].copy_from_slice(&timestamp.to_be_bytes());
    aad[10..18].copy_from_slice(&route_id.to_be_bytes());
    aad
}

fn mark_retransmit(datagram: &[u8]) -> Vec<u8> {
    let mut copy = datagram.to_vec();
    if copy.len() >= crate::HEADER_SIZE {
        let flags = u16::from_be_bytes([copy[14], copy[15]]) | PacketFlags::RETRANSMIT;
        copy[14..16].copy_from_slice(&flags.to_be_bytes());
    }
    copy
}

fn parse_nack(body: &[u8]) -> Option<Vec<u32>> {
    let count_bytes: [u8; 2] = body.get(..2)?.try_into().ok()?;
    let count = u16::from_be_bytes(count_bytes) as usize;
    let entries = body.get(2..)?;
    if entries.len() != count * 4 || count > MAX_NACK_ENTRIES {
        return None;
    }
    Some(
        entries
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::EnvelopeError;
    use rand_core::OsRng;

    const ALICE: PeerId = [0xA1; 32];
    const BOB: PeerId = [0xB0; 32];

    struct Harness {
        alice: ProtocolCore,
        bob: ProtocolCore,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        harness_with(ProtocolConfig::default())
    }

    fn harness_with(config: ProtocolConfig) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let alice = ProtocolCore::with_clock(ALICE, config.clone(), clock.clone()).unwrap();
        let bob = ProtocolCore::with_clock(BOB, config, clock.clone()).unwrap();

        let alice_key = PrivateKey::generate(&mut OsRng);
        let bob_key = PrivateKey::generate(&mut OsRng);
        alice
            .create_connection(&alice_key, BOB, &bob_key.public_key())
            .unwrap();
        bob.create_connection(&bob_key, ALICE, &alice_key.public_key())
            .unwrap();
        Harness { alice, bob, clock }
    }

    #[test]
    fn test_zero_rtt_data() {
        let h = harness();
        let datagram = h.alice.create_data_packet(&BOB, b"hello").unwrap();

        let received = h.bob.process_packet(&datagram).unwrap();
        assert_eq!(received.peer_id, ALICE);
        assert_eq!(received.sequence, 0);
        assert_eq!(received.event, PacketEvent::Data(b"hello".to_vec()));
        assert!(received.missing.is_empty());
    }

    #[test]
    fn test_duplicate_datagram_is_replay() {
        let h = harness();
        let datagram = h.alice.create_data_packet(&BOB, b"hello").unwrap();

        h.bob.process_packet(&datagram).unwrap();
        let err = h.bob.process_packet(&datagram).unwrap_err();
        assert!(matches!(
            err,
            PacketError::KeyStore(KeyStoreError::ReplayDetected { sequence: 0 })
        ));
        assert_eq!(h.bob.security_metrics().replays, 1);
    }

    #[test]
    fn test_header_tampering_detected() {
        let h = harness();
        let mut datagram = h.alice.create_data_packet(&BOB, b"hello").unwrap();
        // Change the timestamp
        datagram[9] ^= 0x01;

        assert!(matches!(
            h.bob.process_packet(&datagram),
            Err(PacketError::KeyStore(KeyStoreError::AuthenticationFailed { .. }))
        ));
        assert_eq!(h.bob.security_metrics().authentication_failures, 1);
    }

    #[test]
    fn test_sequence_mismatch() {
        let h = harness();
        let mut datagram = h.alice.create_data_packet(&BOB, b"hello").unwrap();
        datagram[7] = 5;
        assert!(matches!(
            h.bob.process_packet(&datagram),
            Err(PacketError::SequenceMismatch { header: 5, sealed: 0 })
        ));
    }

    #[test]
    fn test_garbage_is_dropped() {
        let h = harness();
        assert!(matches!(
            h.bob.process_packet(b"not a datagram"),
            Err(PacketError::Malformed(_))
        ));

        let header = DatagramHeader::new(PacketType::Data, 0, 0, PacketFlags::new());
        let unknown = datagram::encode(&header, &[0xFF; 40]).unwrap();
        assert!(matches!(
            h.bob.process_packet(&unknown),
            Err(PacketError::UnknownRoute(_))
        ));

        let short = datagram::encode(&header, &[0x01; 4]).unwrap();
        assert!(matches!(
            h.bob.process_packet(&short),
            Err(PacketError::MissingRoute)
        ));

        let metrics = h.bob.security_metrics();
        assert_eq!(metrics.malformed, 2);
        assert_eq!(metrics.unknown_routes, 1);
    }

    #[test]
    fn test_ack_measures_rtt_and_clears_pending() {
        let h = harness();
        let datagram = h.alice.create_data_packet(&BOB, b"ping").unwrap();
        assert_eq!(h.alice.pending_count(&BOB), 1);

        let received = h.bob.process_packet(&datagram).unwrap();
        h.clock.advance(Duration::from_millis(40));
        let ack = h
            .bob
            .create_ack_packet(&ALICE, received.sequence, received.timestamp)
            .unwrap();

        let ack = h.alice.process_packet(&ack).unwrap();
        assert_eq!(
            ack.event,
            PacketEvent::Ack {
                acked_sequence: 0,
                rtt: Duration::from_millis(40)
            }
        );
        assert_eq!(h.alice.pending_count(&BOB), 0);

        let flow = h.alice.flow().snapshot(&BOB).unwrap();
        assert_eq!(flow.packets_in_flight, 0);
        assert_eq!(flow.rtt_min, Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_gap_nack_retransmit() {
        let h = harness();
        let first = h.alice.create_data_packet(&BOB, b"one").unwrap();
        let lost = h.alice.create_data_packet(&BOB, b"two").unwrap();
        let third = h.alice.create_data_packet(&BOB, b"three").unwrap();

        h.bob.process_packet(&first).unwrap();
        let received = h.bob.process_packet(&third).unwrap();
        assert_eq!(received.missing, vec![1]);

        let nack = h.bob.create_nack_packet(&ALICE, &received.missing).unwrap();
        let reply = h.alice.process_packet(&nack).unwrap();
        let PacketEvent::Nack {
            requested,
            retransmit,
        } = reply.event
        else {
            panic!("expected NACK");
        };
        assert_eq!(requested, vec![1]);
        assert_eq!(retransmit.len(), 1);
        // Same ciphertext, only the RETRANSMIT bit differs
        assert_eq!(retransmit[0][crate::HEADER_SIZE..], lost[crate::HEADER_SIZE..]);
        assert!(h.alice.flow().is_throttled(&BOB));

        let recovered = h.bob.process_packet(&retransmit[0]).unwrap();
        assert_eq!(recovered.event, PacketEvent::Data(b"two".to_vec()));
        assert!(recovered.flags.is_retransmit());
        assert!(h.bob.pulse().pending_gaps(&ALICE).is_empty());
    }

    #[test]
    fn test_pulse_floor_discards_unrecoverable_gaps() {
        let h = harness();
        // Control packets are never queued for retransmission
        let _lost = h.alice.create_flow_packet(&BOB, 64).unwrap();
        let data = h.alice.create_data_packet(&BOB, b"x").unwrap();

        let received = h.bob.process_packet(&data).unwrap();
        assert_eq!(received.missing, vec![0]);

        // Pending floor is the data packet at sequence 1
        let pulse = h.alice.create_pulse_packet(&BOB).unwrap();
        assert_eq!(h.bob.process_packet(&pulse).unwrap().event, PacketEvent::Pulse);
        assert!(h.bob.pulse().pending_gaps(&ALICE).is_empty());
    }

    #[test]
    fn test_flow_packet_sets_peer_window() {
        let h = harness();
        let datagram = h.alice.create_flow_packet(&BOB, 3).unwrap();
        let received = h.bob.process_packet(&datagram).unwrap();

        assert_eq!(received.event, PacketEvent::Flow { window: 3 });
        assert_eq!(h.bob.flow().snapshot(&ALICE).unwrap().peer_window, Some(3));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let h = harness();
        let hidden = Hidden::new("note", b"secret".to_vec());
        let datagram = h.alice.send_envelope(&BOB, &hidden, Priority::Urgent).unwrap();

        let parsed = datagram::decode(&datagram).unwrap();
        assert!(parsed.flags.is_envelope());

        let received = h.bob.process_packet(&datagram).unwrap();
        let PacketEvent::Envelope { manifest, hidden: opened } = received.event else {
            panic!("expected envelope");
        };
        assert_eq!(manifest.sender_id, ALICE);
        assert_eq!(manifest.recipient_id, BOB);
        assert_eq!(manifest.priority, Priority::Urgent);
        assert_eq!(opened, hidden);
    }

    #[test]
    fn test_envelope_header_is_authenticated() {
        let h = harness();
        let hidden = Hidden::new("note", b"secret".to_vec());
        let datagram = h.alice.send_envelope(&BOB, &hidden, Priority::Normal).unwrap();

        // Backdate the timestamp so an echoed ACK would report a huge RTT
        let mut backdated = datagram.clone();
        let timestamp = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        backdated[8..12].copy_from_slice(&timestamp.wrapping_sub(3_600_000).to_be_bytes());

        assert!(matches!(
            h.bob.process_packet(&backdated),
            Err(PacketError::Envelope(EnvelopeError::Decryption(
                KeyStoreError::AuthenticationFailed { sequence: 0 }
            )))
        ));
        assert_eq!(h.bob.security_metrics().authentication_failures, 1);

        // Untouched datagram still opens, also when re-flagged as a retransmit
        let retransmit = mark_retransmit(&datagram);
        let received = h.bob.process_packet(&retransmit).unwrap();
        assert_eq!(received.timestamp, timestamp);
        assert!(matches!(received.event, PacketEvent::Envelope { .. }));
    }

    #[test]
    fn test_reestablish_keeps_session_state() {
        let clock = Arc::new(ManualClock::default());
        let alice = ProtocolCore::with_clock(ALICE, ProtocolConfig::default(), clock.clone()).unwrap();
        let bob = ProtocolCore::with_clock(BOB, ProtocolConfig::default(), clock).unwrap();
        let alice_key = PrivateKey::generate(&mut OsRng);
        let bob_key = PrivateKey::generate(&mut OsRng);
        let route = alice
            .create_connection(&alice_key, BOB, &bob_key.public_key())
            .unwrap();
        bob.create_connection(&bob_key, ALICE, &alice_key.public_key())
            .unwrap();

        let first = alice.create_data_packet(&BOB, b"first").unwrap();
        bob.process_packet(&first).unwrap();

        let mut events = alice.subscribe();
        let again = alice
            .create_connection(&alice_key, BOB, &bob_key.public_key())
            .unwrap();
        bob.create_connection(&bob_key, ALICE, &alice_key.public_key())
            .unwrap();
        assert_eq!(again, route);
        assert!(events.try_recv().is_err());

        assert!(matches!(
            bob.process_packet(&first),
            Err(PacketError::KeyStore(KeyStoreError::ReplayDetected { sequence: 0 }))
        ));
        assert_eq!(alice.pending_count(&BOB), 1);
        assert_eq!(bob.pulse().expected_sequence(&ALICE), Some(1));

        let second = alice.create_data_packet(&BOB, b"second").unwrap();
        assert_eq!(bob.process_packet(&second).unwrap().sequence, 1);
    }

    #[test]
    fn test_close_tears_down_both_sides() {
        let h = harness();
        let mut events = h.bob.subscribe();

        let close = h.alice.create_close_packet(&BOB).unwrap();
        assert!(!h.alice.has_session(&BOB));

        let received = h.bob.process_packet(&close).unwrap();
        assert_eq!(received.event, PacketEvent::Close);
        assert!(!h.bob.has_session(&ALICE));
        assert_eq!(h.bob.routing().route_count(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::Closed {
                peer_id: ALICE,
                remote: true
            }
        );
    }

    #[test]
    fn test_disconnect_then_packets_unrouted() {
        let h = harness();
        let datagram = h.alice.create_data_packet(&BOB, b"late").unwrap();

        assert!(h.bob.disconnect(&ALICE));
        assert!(!h.bob.disconnect(&ALICE));
        assert!(matches!(
            h.bob.process_packet(&datagram),
            Err(PacketError::UnknownRoute(_))
        ));
    }

    #[test]
    fn test_send_without_session() {
        let h = harness();
        assert!(matches!(
            h.alice.create_data_packet(&[0xEE; 32], b"x"),
            Err(Error::KeyStore(KeyStoreError::NoSession(_)))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected_before_sealing() {
        let h = harness();
        let payload = vec![0u8; 70_000];
        assert!(matches!(
            h.alice.create_data_packet(&BOB, &payload),
            Err(Error::Frame(FrameError::PayloadTooLarge(70_000)))
        ));
        assert_eq!(
            h.alice.keystore().inspect(&BOB, |r| r.next_send_sequence()),
            Some(0)
        );
    }

    #[test]
    fn test_rotation_event() {
        let mut config = ProtocolConfig::default();
        config.keystore.rotation_threshold = 2;
        let h = harness_with(config);
        let mut events = h.bob.subscribe();

        for _ in 0..2 {
            let datagram = h.alice.create_data_packet(&BOB, b"m").unwrap();
            h.bob.process_packet(&datagram).unwrap();
        }

        assert!(h.bob.needs_rotation(&ALICE));
        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::RotationDue { peer_id: ALICE }
        );
        // Only once
        let datagram = h.alice.create_data_packet(&BOB, b"m").unwrap();
        h.bob.process_packet(&datagram).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_poll_timers() {
        let h = harness();
        let mut events = h.alice.subscribe();

        h.clock.advance(Duration::from_millis(100));
        let actions = h.alice.poll_timers();
        assert_eq!(actions.pulse_due, vec![BOB]);
        assert!(actions.unhealthy.is_empty());

        h.clock.advance(Duration::from_millis(200));
        let actions = h.alice.poll_timers();
        assert_eq!(actions.unhealthy, vec![BOB]);
        assert!(matches!(
            events.try_recv().unwrap(),
            PeerEvent::Unhealthy { peer_id: BOB, .. }
        ));

        // Reported once per silence period
        h.clock.advance(Duration::from_millis(100));
        assert!(h.alice.poll_timers().unhealthy.is_empty());
    }

    #[test]
    fn test_security_failure_event() {
        let h = harness();
        let mut events = h.bob.subscribe();
        let datagram = h.alice.create_data_packet(&BOB, b"x").unwrap();
        h.bob.process_packet(&datagram).unwrap();
        let _ = h.bob.process_packet(&datagram);

        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::SecurityFailure {
                peer_id: ALICE,
                kind: SecurityEventType::Replay,
                sequence: 0
            }
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ProtocolConfig::default();
        config.pulse.interval_ms = 0;
        assert!(ProtocolCore::new(ALICE, config).is_err());
    }

    #[test]
    fn test_parse_nack_bounds() {
        assert_eq!(parse_nack(&[0, 1, 0, 0, 0, 7]), Some(vec![7]));
        assert_eq!(parse_nack(&[0, 2, 0, 0, 0, 7]), None);
        assert_eq!(parse_nack(&[0]), None);
        assert_eq!(parse_nack(&[0, 0]), Some(vec![]));
    }
}
