//! Route table: route id -> peer.
//!
//! Every payload the core produces starts with an 8-byte route id derived
//! from the session master secret. Both ends of a session derive the same
//! value, so an incoming datagram is mapped to its session with one lookup
//! instead of trial-decrypting under every known peer.
//!
//! ```text
//! Incoming datagram
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ Parse header        │
//! └──────────┬──────────┘
//!            ▼
//! ┌─────────────────────┐     ┌───────────────────────┐
//! │ Route id (8 bytes)  │────▶│ RoutingTable (DashMap)│
//! └──────────┬──────────┘     └───────────────────────┘
//!            ▼
//! ┌─────────────────────┐
//! │ Decrypt under peer  │
//! └─────────────────────┘
//! ```

use crate::{PeerId, ROUTE_ID_SIZE, short_id};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Route id -> peer mapping with lookup statistics.
pub struct RoutingTable {
    routes: DashMap<u64, PeerId>,
    total_lookups: AtomicU64,
    failed_lookups: AtomicU64,
}

impl RoutingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            total_lookups: AtomicU64::new(0),
            failed_lookups: AtomicU64::new(0),
        }
    }

    /// Map `route_id` to `peer_id`, replacing any previous mapping.
    pub fn add_route(&self, route_id: u64, peer_id: PeerId) {
        tracing::debug!("Adding route {:016x} -> {}", route_id, short_id(&peer_id));
        self.routes.insert(route_id, peer_id);
    }

    /// Remove a route.
    pub fn remove_route(&self, route_id: u64) -> Option<PeerId> {
        tracing::debug!("Removing route {:016x}", route_id);
        self.routes.remove(&route_id).map(|(_, peer)| peer)
    }

    /// Remove every route pointing at `peer_id`.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.routes.retain(|_, peer| peer != peer_id);
    }

    /// Find the peer for a route id.
    pub fn lookup(&self, route_id: u64) -> Option<PeerId> {
        self.total_lookups.fetch_add(1, Ordering::Relaxed);
        let peer = self.routes.get(&route_id).map(|entry| *entry.value());
        if peer.is_none() {
            self.failed_lookups.fetch_add(1, Ordering::Relaxed);
        }
        peer
    }

    /// Number of routes.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Lookup statistics.
    #[must_use]
    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            active_routes: self.routes.len(),
            total_lookups: self.total_lookups.load(Ordering::Relaxed),
            failed_lookups: self.failed_lookups.load(Ordering::Relaxed),
        }
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing table statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingStats {
    /// Number of active routes
    pub active_routes: usize,
    /// Total lookups
    pub total_lookups: u64,
    /// Lookups that found no route
    pub failed_lookups: u64,
}

/// Read the route id prefix of a payload.
#[must_use]
pub fn extract_route_id(payload: &[u8]) -> Option<u64> {
    let prefix: [u8; ROUTE_ID_SIZE] = payload.get(..ROUTE_ID_SIZE)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}
