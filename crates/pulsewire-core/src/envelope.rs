//! Dual-layer envelopes.
//!
//! An envelope separates cleartext routing metadata (the [`Manifest`]) from
//! encrypted content (the [`Hidden`] payload). Intermediaries read the
//! manifest with [`extract_manifest`] and never need a session key; only the
//! recipient can open the hidden layer.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------------+--------------------+------------------------------+
//! | Manifest len    | Manifest (78B)     | Sealed hidden                |
//! | (2B, BE)        |                    | (seq || ciphertext || tag)   |
//! +-----------------+--------------------+------------------------------+
//!
//! Manifest:
//! +-----+-----------+--------------+-----+-----------+-------------+
//! | ver | sender 32 | recipient 32 | pri | timestamp | hidden_size |
//! | 1B  |           |              | 1B  | 8B BE     | 4B BE       |
//! +-----+-----------+--------------+-----+-----------+-------------+
//! ```
//!
//! The manifest bytes are the associated data of the hidden layer's AEAD, so
//! a router that rewrites the recipient, priority or any other field causes
//! the recipient's open to fail authentication. [`seal_with_aad`] appends
//! extra bound bytes (the enclosing datagram header) after the manifest.

use crate::PeerId;
use crate::error::EnvelopeError;
use crate::keystore::{KeyStore, SEALED_OVERHEAD, sealed_sequence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Manifest format version
pub const MANIFEST_VERSION: u8 = 1;

/// Encoded manifest size
pub const MANIFEST_SIZE: usize = 1 + 32 + 32 + 1 + 8 + 4;

const LENGTH_PREFIX_SIZE: usize = 2;

/// Delivery priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    /// Deliver immediately
    Urgent = 0,
    /// Default class
    Normal = 1,
    /// May be delayed behind normal traffic
    Deferred = 2,
    /// Delivered when nothing else is queued
    Background = 3,
}

impl TryFrom<u8> for Priority {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Urgent),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Deferred),
            3 => Ok(Self::Background),
            other => Err(EnvelopeError::InvalidPriority(other)),
        }
    }
}

/// Cleartext routing metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    /// Format version
    pub version: u8,
    /// Originating peer
    pub sender_id: PeerId,
    /// Destination peer
    pub recipient_id: PeerId,
    /// Priority class
    pub priority: Priority,
    /// Creation time (unix ms)
    pub timestamp: u64,
    /// Size of the sealed hidden layer in bytes
    pub hidden_size: u32,
}

impl Manifest {
    /// Encode to the fixed 78-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; MANIFEST_SIZE] {
        let mut out = [0u8; MANIFEST_SIZE];
        out[0] = self.version;
        out[1..33].copy_from_slice(&self.sender_id);
        out[33..65].copy_from_slice(&self.recipient_id);
        out[65] = self.priority as u8;
        out[66..74].copy_from_slice(&self.timestamp.to_be_bytes());
        out[74..78].copy_from_slice(&self.hidden_size.to_be_bytes());
        out
    }

    /// Decode from the fixed layout.
    ///
    /// # Errors
    ///
    /// Returns an error on a wrong length, unknown version or unknown priority.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != MANIFEST_SIZE {
            return Err(EnvelopeError::MalformedManifest("wrong manifest length"));
        }
        if bytes[0] != MANIFEST_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(bytes[0]));
        }

        let mut sender_id = [0u8; 32];
        sender_id.copy_from_slice(&bytes[1..33]);
        let mut recipient_id = [0u8; 32];
        recipient_id.copy_from_slice(&bytes[33..65]);

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[66..74]);
        let mut hidden_size = [0u8; 4];
        hidden_size.copy_from_slice(&bytes[74..78]);

        Ok(Self {
            version: bytes[0],
            sender_id,
            recipient_id,
            priority: Priority::try_from(bytes[65])?,
            timestamp: u64::from_be_bytes(timestamp),
            hidden_size: u32::from_be_bytes(hidden_size),
        })
    }
}

/// Encrypted content layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hidden {
    /// Application-defined content type
    pub kind: String,
    /// Content bytes
    #[serde(with = "crate::encoding::base64_bytes")]
    pub content: Vec<u8>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Hidden {
    /// Hidden payload with no metadata.
    pub fn new(kind: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A sealed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Cleartext manifest
    pub manifest: Manifest,
    /// Sealed hidden layer (sequence || ciphertext || tag)
    pub sealed: Vec<u8>,
}

impl Envelope {
    /// Key store sequence that sealed the hidden layer.
    #[must_use]
    pub fn sequence(&self) -> Option<u32> {
        sealed_sequence(&self.sealed)
    }

    /// Serialize: length-prefixed manifest followed by the sealed hidden layer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + MANIFEST_SIZE + self.sealed.len());
        out.extend_from_slice(&(MANIFEST_SIZE as u16).to_be_bytes());
        out.extend_from_slice(&self.manifest.to_bytes());
        out.extend_from_slice(&self.sealed);
        out
    }

    /// Parse serialized envelope bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MalformedManifest`] if the manifest is invalid
    /// or the hidden layer's length disagrees with `hidden_size`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let manifest = extract_manifest(bytes)?;
        let sealed = &bytes[LENGTH_PREFIX_SIZE + MANIFEST_SIZE..];

        if sealed.len() != manifest.hidden_size as usize {
            return Err(EnvelopeError::MalformedManifest(
                "hidden size does not match payload",
            ));
        }

        Ok(Self {
            manifest,
            sealed: sealed.to_vec(),
        })
    }
}

/// Read the manifest from serialized envelope bytes.
///
/// Only the length prefix and manifest are read; the sealed region is never
/// touched, so this is safe to call with no session for either peer.
///
/// # Errors
///
/// Returns an error if the prefix or manifest is truncated or invalid.
pub fn extract_manifest(bytes: &[u8]) -> Result<Manifest, EnvelopeError> {
    let prefix = bytes
        .get(..LENGTH_PREFIX_SIZE)
        .ok_or(EnvelopeError::MalformedManifest("missing length prefix"))?;
    let manifest_len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;

    if manifest_len != MANIFEST_SIZE {
        return Err(EnvelopeError::MalformedManifest("unexpected manifest length"));
    }

    let manifest = bytes
        .get(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + manifest_len)
        .ok_or(EnvelopeError::MalformedManifest("truncated manifest"))?;
    Manifest::from_bytes(manifest)
}

/// Seal `hidden` for `recipient_id` under the store's session with it.
///
/// # Errors
///
/// Returns [`EnvelopeError::Encryption`] (typically wrapping
/// [`crate::KeyStoreError::NoSession`]) or a serialization error.
pub fn seal(
    store: &KeyStore,
    sender_id: PeerId,
    recipient_id: PeerId,
    hidden: &Hidden,
    priority: Priority,
    timestamp: u64,
) -> Result<Envelope, EnvelopeError> {
    seal_with_aad(store, sender_id, recipient_id, hidden, priority, timestamp, &[])
}

/// [`seal`], additionally authenticating `binding` (e.g. the enclosing
/// datagram header). The binding travels outside the envelope; [`open_with_aad`]
/// must be given the same bytes.
///
/// # Errors
///
/// As [`seal`].
pub fn seal_with_aad(
    store: &KeyStore,
    sender_id: PeerId,
    recipient_id: PeerId,
    hidden: &Hidden,
    priority: Priority,
    timestamp: u64,
    binding: &[u8],
) -> Result<Envelope, EnvelopeError> {
    let plaintext = serde_json::to_vec(hidden)?;
    let hidden_size = u32::try_from(plaintext.len() + SEALED_OVERHEAD)
        .map_err(|_| EnvelopeError::MalformedManifest("hidden content too large"))?;

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        sender_id,
        recipient_id,
        priority,
        timestamp,
        hidden_size,
    };

    let (sealed, _) = store
        .encrypt_with_aad(&recipient_id, &plaintext, &associated_data(&manifest, binding))
        .map_err(EnvelopeError::Encryption)?;

    Ok(Envelope { manifest, sealed })
}

/// Open an envelope under the store's session with its sender.
///
/// Replays and forgeries surface as distinct [`EnvelopeError::Decryption`]
/// causes ([`crate::KeyStoreError::ReplayDetected`] and
/// [`crate::KeyStoreError::AuthenticationFailed`]).
///
/// # Errors
///
/// Returns [`EnvelopeError::Decryption`] or a deserialization error.
pub fn open(store: &KeyStore, envelope: &Envelope) -> Result<Hidden, EnvelopeError> {
    open_with_aad(store, envelope, &[])
}

/// [`open`] for an envelope sealed with [`seal_with_aad`].
///
/// # Errors
///
/// As [`open`]; a different `binding` fails authentication.
pub fn open_with_aad(
    store: &KeyStore,
    envelope: &Envelope,
    binding: &[u8],
) -> Result<Hidden, EnvelopeError> {
    let plaintext = store
        .decrypt_with_aad(
            &envelope.manifest.sender_id,
            &envelope.sealed,
            &associated_data(&envelope.manifest, binding),
        )
        .map_err(EnvelopeError::Decryption)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

fn associated_data(manifest: &Manifest, binding: &[u8]) -> Vec<u8> {
    let mut aad = manifest.to_bytes().to_vec();
    aad.extend_from_slice(binding);
    aad
}
