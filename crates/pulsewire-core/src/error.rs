//! Error types for the PULSEWIRE core protocol.
//!
//! Send-side errors ([`KeyStoreError::NoSession`], [`KeyStoreError::KeyAgreement`])
//! indicate misuse and surface synchronously. Receive-side errors are
//! returned as values so one hostile datagram never takes down a listener.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Key store error
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Datagram header error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Packet processing error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Envelope error
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] pulsewire_crypto::CryptoError),
}

/// Puncturable key store errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Peer key malformed, low-order, badly signed, or reusing retired material
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    /// No session established for the peer
    #[error("no session for peer {0}")]
    NoSession(String),

    /// Sequence already punctured
    #[error("replay detected for sequence {sequence}")]
    ReplayDetected {
        /// The replayed sequence number
        sequence: u32,
    },

    /// AEAD tag mismatch
    #[error("authentication failed for sequence {sequence}")]
    AuthenticationFailed {
        /// The sequence number carried by the forged/corrupt ciphertext
        sequence: u32,
    },

    /// Ciphertext too short to carry a sequence and tag
    #[error("malformed ciphertext")]
    MalformedCiphertext,

    /// All 2^32 send sequences consumed
    #[error("send sequence space exhausted, rotation required")]
    SequenceExhausted,

    /// Encryption primitive failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Snapshot export/import failed
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl KeyStoreError {
    /// True for failures caused by received bytes rather than local misuse.
    #[must_use]
    pub fn is_adversarial(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected { .. } | Self::AuthenticationFailed { .. } | Self::MalformedCiphertext
        )
    }
}

/// Datagram header parse errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram too short to hold a header
    #[error("datagram too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Magic bytes do not identify this protocol
    #[error("bad magic: 0x{0:04X}")]
    BadMagic(u16),

    /// Unsupported protocol version
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid packet type byte
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Declared payload length exceeds the datagram
    #[error("payload length exceeds datagram size")]
    PayloadOverflow,

    /// Payload larger than the 16-bit length field allows
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Receive-path errors for a single datagram
#[derive(Debug, Error)]
pub enum PacketError {
    /// Header failed to parse
    #[error("malformed packet: {0}")]
    Malformed(#[from] FrameError),

    /// Payload too short to carry a route id
    #[error("missing route id")]
    MissingRoute,

    /// Route id not known to this core
    #[error("unknown route {0:016x}")]
    UnknownRoute(u64),

    /// Decryption failed
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Envelope could not be opened
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Header sequence disagrees with the sealed sequence
    #[error("sequence mismatch: header {header}, sealed {sealed}")]
    SequenceMismatch {
        /// Sequence in the cleartext header
        header: u32,
        /// Sequence embedded in the sealed body
        sealed: u32,
    },

    /// Decrypted control body has the wrong shape
    #[error("invalid {0} body")]
    InvalidBody(&'static str),
}

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Hidden content could not be encrypted (usually no session)
    #[error("encryption error: {0}")]
    Encryption(#[source] KeyStoreError),

    /// Hidden content could not be decrypted (replay, forgery, no session)
    #[error("decryption error: {0}")]
    Decryption(#[source] KeyStoreError),

    /// Manifest bytes are truncated or inconsistent
    #[error("malformed manifest: {0}")]
    MalformedManifest(&'static str),

    /// Manifest version not understood
    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown priority class byte
    #[error("invalid priority class: {0}")]
    InvalidPriority(u8),

    /// Hidden payload (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnvelopeError {
    /// The key store failure behind an encryption/decryption error.
    #[must_use]
    pub fn key_store_error(&self) -> Option<&KeyStoreError> {
        match self {
            Self::Encryption(e) | Self::Decryption(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse failure
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization failure
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantic validation failure
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, Error>;
