//! Puncturable session key store.
//!
//! Each peer has one [`SessionKeyRecord`] holding a master secret from an
//! X25519 agreement. Every message is sealed under its own key, derived from
//! the master secret and the message's sequence number, and every sequence
//! that decrypts successfully is *punctured*: recorded so that the same
//! sequence can never be decrypted again under this record.
//!
//! ## Sealed Format
//!
//! ```text
//! +-------------------+-----------------------------+
//! | Sequence (4B BE)  | Ciphertext || Tag (N + 16)  |
//! +-------------------+-----------------------------+
//! ```
//!
//! ## Key Schedule
//!
//! ```text
//! dh          = X25519(local_private, peer_public)
//! master      = HKDF-BLAKE3(salt = MASTER_SALT, ikm = dh,
//!                           info = MASTER_INFO || min(pub) || max(pub))
//! seq_key(s)  = HKDF-Expand(master, SEQUENCE_INFO || sender_pub || s)
//! nonce_salt  = HKDF-Expand(master, NONCE_INFO)[..16]
//! route_id    = HKDF-Expand(master, ROUTE_INFO)[..8]
//! ```
//!
//! The sender's public key in the sequence-key info keeps the two directions
//! of a session apart, so both peers can start at sequence 0 without ever
//! reusing a key.
//!
//! Puncturing gives replay protection only. It does not protect the master
//! secret: a compromised master secret decrypts every recorded message of the
//! session. Sessions are therefore rotated (re-established with fresh agreement
//! keys) once [`KeyStore::needs_rotation`] reports true.

use crate::clock::Clock;
use crate::config::KeyStoreConfig;
use crate::error::KeyStoreError;
use crate::persist::{SNAPSHOT_VERSION, SecretProtector, SessionSnapshot};
use crate::{PeerId, short_id};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pulsewire_crypto::aead::{AeadKey, NONCE_SALT_SIZE, Nonce, TAG_SIZE};
use pulsewire_crypto::constant_time::verify_32;
use pulsewire_crypto::hash::{hash, hkdf_expand, hkdf_extract};
use pulsewire_crypto::signatures::{SignedAgreementKey, VerifyingKey};
use pulsewire_crypto::x25519::{PrivateKey, PublicKey};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const MASTER_SALT: &[u8] = b"pulsewire/v1/master-salt";
const MASTER_INFO: &[u8] = b"pulsewire/v1/master";
const SEQUENCE_INFO: &[u8] = b"pulsewire/v1/sequence";
const NONCE_INFO: &[u8] = b"pulsewire/v1/nonce-salt";
const ROUTE_INFO: &[u8] = b"pulsewire/v1/route";
const FINGERPRINT_INFO: &[u8] = b"pulsewire/v1/fingerprint";

/// Size of the sequence prefix on sealed payloads.
pub const SEQUENCE_PREFIX_SIZE: usize = 4;

/// Bytes a sealed payload adds on top of its plaintext.
pub const SEALED_OVERHEAD: usize = SEQUENCE_PREFIX_SIZE + TAG_SIZE;

/// Which side of the session produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Messages this node sends
    Outbound,
    /// Messages this node receives
    Inbound,
}

/// Read the sequence number embedded in a sealed payload.
#[must_use]
pub fn sealed_sequence(sealed: &[u8]) -> Option<u32> {
    let prefix: [u8; SEQUENCE_PREFIX_SIZE] = sealed.get(..SEQUENCE_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix))
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct MasterSecret([u8; 32]);

/// Key material for a single sequence number.
pub struct SequenceKey {
    key: AeadKey,
    nonce: Nonce,
}

impl SequenceKey {
    /// Raw key bytes.
    ///
    /// # Security
    ///
    /// Exposes key material; intended for diagnostics and tests.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    /// Nonce paired with this key.
    #[must_use]
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

/// Per-peer session state.
pub struct SessionKeyRecord {
    peer_id: PeerId,
    master_secret: MasterSecret,
    nonce_salt: [u8; NONCE_SALT_SIZE],
    route_id: u64,
    local_public: PublicKey,
    peer_public: PublicKey,
    // u64 so that exhaustion of the u32 space is representable
    next_send_sequence: u64,
    punctured: BTreeSet<u32>,
    created_at: u64,
    last_punctured_at: Option<u64>,
}

impl SessionKeyRecord {
    fn from_master(
        peer_id: PeerId,
        master: [u8; 32],
        local_public: PublicKey,
        peer_public: PublicKey,
        created_at: u64,
    ) -> Self {
        let master_secret = MasterSecret(master);

        let mut nonce_salt = [0u8; NONCE_SALT_SIZE];
        hkdf_expand(&master_secret.0, NONCE_INFO, &mut nonce_salt);

        let mut route = [0u8; 8];
        hkdf_expand(&master_secret.0, ROUTE_INFO, &mut route);

        Self {
            peer_id,
            master_secret,
            nonce_salt,
            route_id: u64::from_be_bytes(route),
            local_public,
            peer_public,
            next_send_sequence: 0,
            punctured: BTreeSet::new(),
            created_at,
            last_punctured_at: None,
        }
    }

    /// Remote peer identifier
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Route identifier shared by both ends of the session
    #[must_use]
    pub fn route_id(&self) -> u64 {
        self.route_id
    }

    /// Next sequence number `encrypt` will allocate
    #[must_use]
    pub fn next_send_sequence(&self) -> u64 {
        self.next_send_sequence
    }

    /// Number of punctured sequences
    #[must_use]
    pub fn punctured_count(&self) -> usize {
        self.punctured.len()
    }

    /// Whether `sequence` has been consumed
    #[must_use]
    pub fn is_punctured(&self, sequence: u32) -> bool {
        self.punctured.contains(&sequence)
    }

    /// Creation time (unix ms)
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the most recent puncture (unix ms)
    #[must_use]
    pub fn last_punctured_at(&self) -> Option<u64> {
        self.last_punctured_at
    }

    /// Derive the key for `sequence` in the given direction.
    ///
    /// Deterministic: the same record, direction and sequence always yield the
    /// same key.
    #[must_use]
    pub fn derive_sequence_key(&self, direction: Direction, sequence: u32) -> SequenceKey {
        let sender = match direction {
            Direction::Outbound => &self.local_public,
            Direction::Inbound => &self.peer_public,
        };

        let mut info = Vec::with_capacity(SEQUENCE_INFO.len() + 32 + 4);
        info.extend_from_slice(SEQUENCE_INFO);
        info.extend_from_slice(sender.as_bytes());
        info.extend_from_slice(&sequence.to_be_bytes());

        let mut key = [0u8; 32];
        hkdf_expand(&self.master_secret.0, &info, &mut key);
        let sequence_key = SequenceKey {
            key: AeadKey::new(key),
            nonce: Nonce::from_sequence(sequence, &self.nonce_salt),
        };
        key.zeroize();
        sequence_key
    }

    fn needs_rotation(&self, threshold: usize) -> bool {
        self.punctured.len() >= threshold || self.next_send_sequence >= threshold as u64
    }

    fn fingerprint(&self) -> [u8; 32] {
        master_fingerprint(&self.master_secret.0)
    }

    fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, u32), KeyStoreError> {
        let sequence =
            u32::try_from(self.next_send_sequence).map_err(|_| KeyStoreError::SequenceExhausted)?;
        self.next_send_sequence += 1;

        let key = self.derive_sequence_key(Direction::Outbound, sequence);
        let ciphertext = key
            .key
            .encrypt(&key.nonce, plaintext, aad)
            .map_err(|_| KeyStoreError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(SEQUENCE_PREFIX_SIZE + ciphertext.len());
        sealed.extend_from_slice(&sequence.to_be_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok((sealed, sequence))
    }

    fn open(&mut self, sealed: &[u8], aad: &[u8], now_ms: u64) -> Result<Vec<u8>, KeyStoreError> {
        if sealed.len() < SEALED_OVERHEAD {
            return Err(KeyStoreError::MalformedCiphertext);
        }
        let sequence = sealed_sequence(sealed).ok_or(KeyStoreError::MalformedCiphertext)?;

        if self.punctured.contains(&sequence) {
            return Err(KeyStoreError::ReplayDetected { sequence });
        }

        let key = self.derive_sequence_key(Direction::Inbound, sequence);
        let plaintext = key
            .key
            .decrypt(&key.nonce, &sealed[SEQUENCE_PREFIX_SIZE..], aad)
            .map_err(|_| KeyStoreError::AuthenticationFailed { sequence })?;

        self.punctured.insert(sequence);
        self.last_punctured_at = Some(now_ms);
        Ok(plaintext)
    }

    fn wipe(&mut self) {
        self.master_secret.zeroize();
        self.nonce_salt.zeroize();
        self.punctured.clear();
    }
}

fn master_fingerprint(master: &[u8; 32]) -> [u8; 32] {
    let mut input = Vec::with_capacity(FINGERPRINT_INFO.len() + 32);
    input.extend_from_slice(FINGERPRINT_INFO);
    input.extend_from_slice(master);
    let fingerprint = hash(&input);
    input.zeroize();
    fingerprint
}

fn agree(local_private: &PrivateKey, peer_public: &PublicKey) -> Result<[u8; 32], KeyStoreError> {
    let local_public = local_private.public_key();
    if local_public == *peer_public {
        return Err(KeyStoreError::KeyAgreement(
            "peer key equals local key".into(),
        ));
    }

    let shared = local_private
        .exchange(peer_public)
        .map_err(|e| KeyStoreError::KeyAgreement(e.to_string()))?;

    let (low, high) = if local_public.as_bytes() < peer_public.as_bytes() {
        (local_public, *peer_public)
    } else {
        (*peer_public, local_public)
    };

    let mut info = Vec::with_capacity(MASTER_INFO.len() + 64);
    info.extend_from_slice(MASTER_INFO);
    info.extend_from_slice(low.as_bytes());
    info.extend_from_slice(high.as_bytes());

    let mut prk = hkdf_extract(MASTER_SALT, shared.as_bytes());
    let mut master = [0u8; 32];
    hkdf_expand(&prk, &info, &mut master);
    prk.zeroize();
    Ok(master)
}

/// Concurrent store of per-peer session key records.
///
/// Records live in a sharded map; every mutation runs under the shard's
/// write guard, so operations for one peer are serialized while different
/// peers proceed independently. [`KeyStore::destroy`] takes the same guard,
/// so it can never interleave with an in-flight encrypt or decrypt.
pub struct KeyStore {
    records: DashMap<PeerId, SessionKeyRecord>,
    retired: Mutex<VecDeque<[u8; 32]>>,
    config: KeyStoreConfig,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    /// Create an empty key store.
    #[must_use]
    pub fn new(config: KeyStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
            config,
            clock,
        }
    }

    /// Establish (or replace) the session with `peer_id`.
    ///
    /// Returns the route id of the session. Establishing again with the live
    /// session's key material leaves the record untouched.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyAgreement`] if the peer key is low-order,
    /// equals the local key, or derives the master secret of a retired session.
    pub fn establish(
        &self,
        peer_id: PeerId,
        local_private: &PrivateKey,
        peer_public: &PublicKey,
    ) -> Result<u64, KeyStoreError> {
        let mut master = agree(local_private, peer_public)?;

        let fingerprint = master_fingerprint(&master);
        if self.is_retired(&fingerprint) {
            master.zeroize();
            tracing::warn!(
                "Refusing session with {}: key material reuses a retired session",
                short_id(&peer_id)
            );
            return Err(KeyStoreError::KeyAgreement(
                "key material reuses a retired session".into(),
            ));
        }

        let route_id = match self.records.entry(peer_id) {
            Entry::Occupied(existing)
                if verify_32(&existing.get().fingerprint(), &fingerprint) =>
            {
                // Same material: counters and punctures must survive
                master.zeroize();
                tracing::debug!("Session with {} already established", short_id(&peer_id));
                return Ok(existing.get().route_id);
            }
            entry => {
                let record = SessionKeyRecord::from_master(
                    peer_id,
                    master,
                    local_private.public_key(),
                    *peer_public,
                    self.clock.unix_millis(),
                );
                master.zeroize();
                let route_id = record.route_id;
                self.install(entry, record);
                route_id
            }
        };

        tracing::debug!(
            "Session established with {} (route {:016x})",
            short_id(&peer_id),
            route_id
        );
        Ok(route_id)
    }

    /// Establish a session after checking the peer's identity signature over
    /// its agreement key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyAgreement`] on a bad signature or any
    /// failure of [`KeyStore::establish`].
    pub fn establish_signed(
        &self,
        peer_id: PeerId,
        local_private: &PrivateKey,
        signed_key: &SignedAgreementKey,
        peer_identity: &VerifyingKey,
    ) -> Result<u64, KeyStoreError> {
        let peer_public = signed_key.verify(peer_identity).map_err(|e| {
            tracing::warn!("Agreement key from {} failed verification", short_id(&peer_id));
            KeyStoreError::KeyAgreement(e.to_string())
        })?;
        self.establish(peer_id, local_private, &peer_public)
    }

    /// Derive the key used for `sequence` in `direction`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`] if no record exists for the peer.
    pub fn derive_sequence_key(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        sequence: u32,
    ) -> Result<SequenceKey, KeyStoreError> {
        let record = self.record(peer_id)?;
        Ok(record.derive_sequence_key(direction, sequence))
    }

    /// Seal `plaintext` under the next send sequence.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`] or [`KeyStoreError::SequenceExhausted`].
    pub fn encrypt(&self, peer_id: &PeerId, plaintext: &[u8]) -> Result<(Vec<u8>, u32), KeyStoreError> {
        self.encrypt_with_aad(peer_id, plaintext, &[])
    }

    /// Seal `plaintext` under the next send sequence, authenticating `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`] or [`KeyStoreError::SequenceExhausted`].
    pub fn encrypt_with_aad(
        &self,
        peer_id: &PeerId,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, u32), KeyStoreError> {
        let mut record = self
            .records
            .get_mut(peer_id)
            .ok_or_else(|| KeyStoreError::NoSession(short_id(peer_id)))?;
        let (sealed, sequence) = record.seal(plaintext, aad)?;

        tracing::trace!("Sealed sequence {} for {}", sequence, short_id(peer_id));
        Ok((sealed, sequence))
    }

    /// Open a sealed payload from `peer_id`, puncturing its sequence on success.
    ///
    /// # Errors
    ///
    /// - [`KeyStoreError::ReplayDetected`] if the sequence was already punctured
    ///   (no decryption is attempted)
    /// - [`KeyStoreError::AuthenticationFailed`] if the AEAD tag does not verify
    ///   (the sequence is left unpunctured)
    /// - [`KeyStoreError::MalformedCiphertext`] or [`KeyStoreError::NoSession`]
    pub fn decrypt(&self, peer_id: &PeerId, sealed: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        self.decrypt_with_aad(peer_id, sealed, &[])
    }

    /// [`KeyStore::decrypt`] with associated data.
    ///
    /// # Errors
    ///
    /// As [`KeyStore::decrypt`].
    pub fn decrypt_with_aad(
        &self,
        peer_id: &PeerId,
        sealed: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, KeyStoreError> {
        let now = self.clock.unix_millis();
        let mut record = self
            .records
            .get_mut(peer_id)
            .ok_or_else(|| KeyStoreError::NoSession(short_id(peer_id)))?;

        match record.open(sealed, aad, now) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                tracing::debug!("Rejected payload from {}: {}", short_id(peer_id), e);
                Err(e)
            }
        }
    }

    /// Destroy the session: zeroize the master secret, clear the puncture
    /// set and drop the record. Returns whether a record existed.
    pub fn destroy(&self, peer_id: &PeerId) -> bool {
        match self.records.remove(peer_id) {
            Some((_, mut record)) => {
                self.retire(record.fingerprint());
                record.wipe();
                tracing::debug!("Session destroyed for {}", short_id(peer_id));
                true
            }
            None => false,
        }
    }

    /// Whether the session has consumed enough sequences to warrant rotation.
    #[must_use]
    pub fn needs_rotation(&self, peer_id: &PeerId) -> bool {
        self.records
            .get(peer_id)
            .is_some_and(|r| r.needs_rotation(self.config.rotation_threshold))
    }

    /// Whether a session exists for the peer.
    #[must_use]
    pub fn has_session(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.records.len()
    }

    /// Number of punctured sequences for the peer (0 if unknown).
    #[must_use]
    pub fn punctured_count(&self, peer_id: &PeerId) -> usize {
        self.records.get(peer_id).map_or(0, |r| r.punctured_count())
    }

    /// Whether `sequence` is punctured for the peer.
    #[must_use]
    pub fn is_punctured(&self, peer_id: &PeerId, sequence: u32) -> bool {
        self.records
            .get(peer_id)
            .is_some_and(|r| r.is_punctured(sequence))
    }

    /// Route id of the peer's session.
    #[must_use]
    pub fn route_id(&self, peer_id: &PeerId) -> Option<u64> {
        self.records.get(peer_id).map(|r| r.route_id)
    }

    /// Run `f` against the peer's record under its guard.
    pub fn inspect<T>(&self, peer_id: &PeerId, f: impl FnOnce(&SessionKeyRecord) -> T) -> Option<T> {
        self.records.get(peer_id).map(|r| f(&r))
    }

    /// Export the peer's session as a snapshot with its master secret sealed
    /// by `protector`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::NoSession`] or [`KeyStoreError::Persistence`].
    pub fn export(
        &self,
        peer_id: &PeerId,
        protector: &dyn SecretProtector,
    ) -> Result<SessionSnapshot, KeyStoreError> {
        // Copy out under the guard; sealing may be slow
        let (master, mut snapshot) = {
            let record = self.record(peer_id)?;
            let snapshot = SessionSnapshot {
                version: SNAPSHOT_VERSION,
                peer_id: *peer_id,
                local_public: record.local_public.to_bytes(),
                peer_public: record.peer_public.to_bytes(),
                next_send_sequence: record.next_send_sequence,
                punctured: record.punctured.iter().copied().collect(),
                created_at: record.created_at,
                last_punctured_at: record.last_punctured_at,
                protected_secret: Vec::new(),
            };
            (Zeroizing::new(record.master_secret.0), snapshot)
        };

        snapshot.protected_secret = protector.protect(&master, &snapshot.context())?;
        tracing::debug!(
            "Exported session for {} ({} punctured)",
            short_id(peer_id),
            snapshot.punctured.len()
        );
        Ok(snapshot)
    }

    /// Rebuild a session from a snapshot. Returns the route id.
    ///
    /// A record for the same session is merged rather than replaced: the send
    /// counter only moves forward and punctures are never forgotten. A record
    /// for a different session is replaced and its material retired.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Persistence`] if the snapshot version is not
    /// understood, its counters are out of range, the secret cannot be
    /// unsealed, or the session was destroyed or replaced.
    pub fn import(
        &self,
        snapshot: &SessionSnapshot,
        protector: &dyn SecretProtector,
    ) -> Result<u64, KeyStoreError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(KeyStoreError::Persistence(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.next_send_sequence > u64::from(u32::MAX) + 1 {
            return Err(KeyStoreError::Persistence(
                "next_send_sequence out of range".into(),
            ));
        }

        let master = protector.unprotect(&snapshot.protected_secret, &snapshot.context())?;

        let fingerprint = master_fingerprint(&master);
        if self.is_retired(&fingerprint) {
            tracing::warn!(
                "Refusing snapshot for {}: session was destroyed or replaced",
                short_id(&snapshot.peer_id)
            );
            return Err(KeyStoreError::Persistence(
                "snapshot belongs to a retired session".into(),
            ));
        }

        let route_id = match self.records.entry(snapshot.peer_id) {
            Entry::Occupied(mut existing)
                if verify_32(&existing.get().fingerprint(), &fingerprint) =>
            {
                // A stale snapshot must never roll the live session back
                let record = existing.get_mut();
                record.next_send_sequence =
                    record.next_send_sequence.max(snapshot.next_send_sequence);
                record.punctured.extend(snapshot.punctured.iter().copied());
                record.last_punctured_at = record.last_punctured_at.max(snapshot.last_punctured_at);
                record.route_id
            }
            entry => {
                let mut record = SessionKeyRecord::from_master(
                    snapshot.peer_id,
                    *master,
                    PublicKey::from_bytes(snapshot.local_public),
                    PublicKey::from_bytes(snapshot.peer_public),
                    snapshot.created_at,
                );
                record.next_send_sequence = snapshot.next_send_sequence;
                record.punctured = snapshot.punctured.iter().copied().collect();
                record.last_punctured_at = snapshot.last_punctured_at;
                let route_id = record.route_id;
                self.install(entry, record);
                route_id
            }
        };

        tracing::info!(
            "Imported session for {} (route {:016x})",
            short_id(&snapshot.peer_id),
            route_id
        );
        Ok(route_id)
    }

    fn record(
        &self,
        peer_id: &PeerId,
    ) -> Result<dashmap::mapref::one::Ref<'_, PeerId, SessionKeyRecord>, KeyStoreError> {
        self.records
            .get(peer_id)
            .ok_or_else(|| KeyStoreError::NoSession(short_id(peer_id)))
    }

    fn install(&self, entry: Entry<'_, PeerId, SessionKeyRecord>, record: SessionKeyRecord) {
        match entry {
            Entry::Occupied(mut existing) => {
                let mut previous = existing.insert(record);
                self.retire(previous.fingerprint());
                previous.wipe();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }
    }

    fn is_retired(&self, fingerprint: &[u8; 32]) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|retired| verify_32(retired, fingerprint))
    }

    fn retire(&self, fingerprint: [u8; 32]) {
        if self.config.retired_fingerprints == 0 {
            return;
        }
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        if retired.len() >= self.config.retired_fingerprints {
            retired.pop_front();
        }
        retired.push_back(fingerprint);
    }
}
