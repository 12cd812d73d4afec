//! Ed25519 signatures binding key-agreement keys to peer identities.
//!
//! A peer's long-term identity is an Ed25519 key. Before a session is
//! established, the peer's X25519 key-agreement key arrives as a
//! [`SignedAgreementKey`]; verifying it against the identity key turns the
//! unauthenticated Diffie-Hellman into an authenticated key agreement.
//!
//! ## Usage
//!
//! ```ignore
//! use pulsewire_crypto::signatures::{SignedAgreementKey, SigningKey};
//!
//! let identity = SigningKey::generate(&mut OsRng);
//! let agreement = PrivateKey::generate(&mut OsRng);
//! let signed = SignedAgreementKey::sign(&identity, &agreement.public_key());
//!
//! let public = signed.verify(&identity.verifying_key())?;
//! ```

use crate::CryptoError;
use crate::x25519::PublicKey;
use ed25519_dalek::Signer;
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Domain separation label for agreement-key signatures.
const AGREEMENT_KEY_CONTEXT: &[u8] = b"pulsewire/v1/agreement-key";

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

/// Ed25519 signing key (identity private key), zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a new random signing key
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Create from raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// Get the corresponding verifying key (public key)
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }
}

/// Ed25519 verifying key (identity public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Create from raw 32-byte public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a valid point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Get the raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verify a signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message under this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify_strict(message, &signature.to_dalek())
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// An X25519 agreement key signed by its owner's identity key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedAgreementKey {
    /// The key-agreement public key
    pub public_key: PublicKey,
    /// Identity signature over the context label and the public key
    pub signature: Signature,
}

impl SignedAgreementKey {
    /// Sign `public_key` with the identity key.
    #[must_use]
    pub fn sign(identity: &SigningKey, public_key: &PublicKey) -> Self {
        let signature = identity.sign(&Self::signed_message(public_key));
        Self {
            public_key: *public_key,
            signature,
        }
    }

    /// Verify against the claimed identity and return the agreement key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature was not
    /// produced by `identity` over this agreement key.
    pub fn verify(&self, identity: &VerifyingKey) -> Result<PublicKey, CryptoError> {
        identity.verify(&Self::signed_message(&self.public_key), &self.signature)?;
        Ok(self.public_key)
    }

    fn signed_message(public_key: &PublicKey) -> Vec<u8> {
        let mut message = Vec::with_capacity(AGREEMENT_KEY_CONTEXT.len() + 32);
        message.extend_from_slice(AGREEMENT_KEY_CONTEXT);
        message.extend_from_slice(public_key.as_bytes());
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::PrivateKey;
    use rand_core::OsRng;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let signature = signing_key.sign(b"authenticate this");
        assert!(verifying_key.verify(b"authenticate this", &signature).is_ok());
        assert!(verifying_key.verify(b"authenticate that", &signature).is_err());
    }

    #[test]
    fn test_signed_agreement_key_verifies() {
        let identity = SigningKey::generate(&mut OsRng);
        let agreement = PrivateKey::generate(&mut OsRng);

        let signed = SignedAgreementKey::sign(&identity, &agreement.public_key());
        let verified = signed.verify(&identity.verifying_key()).unwrap();

        assert_eq!(verified, agreement.public_key());
    }

    #[test]
    fn test_signed_agreement_key_wrong_identity() {
        let identity = SigningKey::generate(&mut OsRng);
        let impostor = SigningKey::generate(&mut OsRng);
        let agreement = PrivateKey::generate(&mut OsRng);

        let signed = SignedAgreementKey::sign(&impostor, &agreement.public_key());
        assert!(matches!(
            signed.verify(&identity.verifying_key()),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_signed_agreement_key_swapped_key() {
        let identity = SigningKey::generate(&mut OsRng);
        let agreement = PrivateKey::generate(&mut OsRng);
        let other = PrivateKey::generate(&mut OsRng);

        let mut signed = SignedAgreementKey::sign(&identity, &agreement.public_key());
        signed.public_key = other.public_key();

        assert!(signed.verify(&identity.verifying_key()).is_err());
    }

    #[test]
    fn test_signature_from_slice_length() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }
}
