//! Session snapshots for resumption across restarts.
//!
//! A [`SessionSnapshot`] carries everything needed to rebuild a session key
//! record. The master secret never appears in cleartext: it is sealed by a
//! [`SecretProtector`] bound to the peer id and both public keys, so a
//! snapshot cannot be grafted onto another session.
//!
//! # Sequence safety
//!
//! A snapshot must be taken after the last message sent under the session.
//! Importing a stale snapshot rewinds `next_send_sequence`, and sending from
//! the rewound record would reuse per-sequence keys.

use crate::PeerId;
use crate::error::KeyStoreError;
use pulsewire_crypto::protect::{WrapParams, WrappedSecret};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Serializable session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Format version
    pub version: u8,
    /// Remote peer identifier
    #[serde(with = "crate::encoding::hex_32")]
    pub peer_id: PeerId,
    /// Local X25519 public key
    #[serde(with = "crate::encoding::hex_32")]
    pub local_public: [u8; 32],
    /// Peer X25519 public key
    #[serde(with = "crate::encoding::hex_32")]
    pub peer_public: [u8; 32],
    /// Next send sequence
    pub next_send_sequence: u64,
    /// Punctured sequences, ascending
    pub punctured: Vec<u32>,
    /// Record creation time (unix ms)
    pub created_at: u64,
    /// Time of the last puncture (unix ms)
    pub last_punctured_at: Option<u64>,
    /// Master secret sealed by a [`SecretProtector`]
    #[serde(with = "crate::encoding::base64_bytes")]
    pub protected_secret: Vec<u8>,
}

impl SessionSnapshot {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Persistence`] if serialization fails.
    pub fn to_json(&self) -> Result<String, KeyStoreError> {
        serde_json::to_string_pretty(self).map_err(|e| KeyStoreError::Persistence(e.to_string()))
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Persistence`] on malformed input.
    pub fn from_json(text: &str) -> Result<Self, KeyStoreError> {
        serde_json::from_str(text).map_err(|e| KeyStoreError::Persistence(e.to_string()))
    }

    /// Binding context for the protected secret.
    pub(crate) fn context(&self) -> Vec<u8> {
        secret_context(&self.peer_id, &self.local_public, &self.peer_public)
    }
}

fn secret_context(peer_id: &PeerId, local_public: &[u8; 32], peer_public: &[u8; 32]) -> Vec<u8> {
    let mut context = Vec::with_capacity(16 + 96);
    context.extend_from_slice(b"pulsewire/v1/snapshot");
    context.extend_from_slice(peer_id);
    context.extend_from_slice(local_public);
    context.extend_from_slice(peer_public);
    context
}

/// Seals and unseals master secrets for storage.
pub trait SecretProtector: Send + Sync {
    /// Seal `secret`, binding `context`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Persistence`] on failure.
    fn protect(&self, secret: &[u8; 32], context: &[u8]) -> Result<Vec<u8>, KeyStoreError>;

    /// Recover a secret sealed by [`SecretProtector::protect`] with the same context.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Persistence`] if the blob is malformed, was
    /// sealed under other credentials, or the context differs.
    fn unprotect(&self, blob: &[u8], context: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyStoreError>;
}

/// Passphrase-based protector (Argon2id + XChaCha20-Poly1305).
pub struct PassphraseProtector {
    passphrase: Zeroizing<Vec<u8>>,
    params: WrapParams,
}

impl PassphraseProtector {
    /// Protector with default Argon2id parameters.
    #[must_use]
    pub fn new(passphrase: &[u8]) -> Self {
        Self::with_params(passphrase, WrapParams::default())
    }

    /// Protector with explicit Argon2id parameters.
    #[must_use]
    pub fn with_params(passphrase: &[u8], params: WrapParams) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.to_vec()),
            params,
        }
    }
}

impl SecretProtector for PassphraseProtector {
    fn protect(&self, secret: &[u8; 32], context: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let wrapped = WrappedSecret::wrap(secret, &self.passphrase, context, self.params)
            .map_err(|e| KeyStoreError::Persistence(e.to_string()))?;
        Ok(wrapped.to_bytes())
    }

    fn unprotect(&self, blob: &[u8], context: &[u8]) -> Result<Zeroizing<[u8; 32]>, KeyStoreError> {
        WrappedSecret::from_bytes(blob)
            .and_then(|wrapped| wrapped.unwrap_secret(&self.passphrase, context))
            .map_err(|e| KeyStoreError::Persistence(e.to_string()))
    }
}
