//! Passphrase wrapping for persisted session secrets.
//!
//! Session snapshots never carry a master secret in the clear. The secret is
//! wrapped under a key stretched from a passphrase with Argon2id and sealed
//! with XChaCha20-Poly1305; the peer identifier is bound as associated data
//! so a wrapped secret cannot be transplanted onto another peer's snapshot.
//!
//! ## Wire Format
//!
//! ```text
//! +-------------+----------------+-------------+-------------+-------------------+
//! | Version (1) | Argon2 (6)     | Salt (32)   | Nonce (24)  | Ciphertext (48)   |
//! +-------------+----------------+-------------+-------------+-------------------+
//! ```

use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

const FORMAT_VERSION: u8 = 1;
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const SECRET_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const PARAMS_SIZE: usize = 6;

/// Encoded size of a [`WrappedSecret`].
pub const WRAPPED_SECRET_SIZE: usize =
    1 + PARAMS_SIZE + SALT_SIZE + NONCE_SIZE + SECRET_SIZE + TAG_SIZE;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,
    /// Number of iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for WrapParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl WrapParams {
    /// Cheap parameters for tests.
    ///
    /// **Warning:** not suitable for production secrets.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn validate(&self) -> Result<(), CryptoError> {
        if self.memory_cost_kib < 8 || self.memory_cost_kib >= 1 << 24 {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must be in [8, 2^24)".into(),
            ));
        }
        if self.iterations < 1 || self.iterations > u32::from(u16::MAX) {
            return Err(CryptoError::InvalidParameter(
                "iterations must be in [1, 65535]".into(),
            ));
        }
        if self.parallelism < 1 || self.parallelism > 255 {
            return Err(CryptoError::InvalidParameter(
                "parallelism must be between 1 and 255".into(),
            ));
        }
        Ok(())
    }

    fn argon2_params(&self) -> Result<Params, CryptoError> {
        self.validate()?;

        ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .build()
            .map_err(|e| CryptoError::InvalidParameter(format!("Argon2 params: {e}")))
    }

    fn to_bytes(self) -> [u8; PARAMS_SIZE] {
        let mut bytes = [0u8; PARAMS_SIZE];
        bytes[0..3].copy_from_slice(&self.memory_cost_kib.to_le_bytes()[0..3]);
        bytes[3..5].copy_from_slice(&(self.iterations as u16).to_le_bytes());
        bytes[5] = self.parallelism as u8;
        bytes
    }

    fn from_bytes(bytes: &[u8; PARAMS_SIZE]) -> Self {
        Self {
            memory_cost_kib: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            iterations: u32::from(u16::from_le_bytes([bytes[3], bytes[4]])),
            parallelism: u32::from(bytes[5]),
        }
    }
}

/// A 32-byte secret sealed under a passphrase-derived key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedSecret {
    params: WrapParams,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl WrappedSecret {
    /// Wrap `secret` under `passphrase`, binding `context` as associated data.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid, the system RNG fails
    /// or encryption fails.
    pub fn wrap(
        secret: &[u8; SECRET_SIZE],
        passphrase: &[u8],
        context: &[u8],
        params: WrapParams,
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut salt)
            .map_err(|e| CryptoError::RandomGenerationFailed(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| CryptoError::RandomGenerationFailed(e.to_string()))?;

        let key = derive_wrapping_key(passphrase, &salt, &params)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: secret.as_slice(),
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(Self {
            params,
            salt,
            nonce,
            ciphertext,
        })
    }

    /// Recover the secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on a wrong passphrase, a
    /// mismatched context or tampered ciphertext.
    pub fn unwrap_secret(
        &self,
        passphrase: &[u8],
        context: &[u8],
    ) -> Result<Zeroizing<[u8; SECRET_SIZE]>, CryptoError> {
        let key = derive_wrapping_key(passphrase, &self.salt, &self.params)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let mut plaintext = cipher
            .decrypt(
                XNonce::from_slice(&self.nonce),
                Payload {
                    msg: self.ciphertext.as_slice(),
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if plaintext.len() != SECRET_SIZE {
            plaintext.zeroize();
            return Err(CryptoError::InvalidKeyMaterial);
        }

        let mut secret = Zeroizing::new([0u8; SECRET_SIZE]);
        secret.copy_from_slice(&plaintext);
        plaintext.zeroize();
        Ok(secret)
    }

    /// Encode for storage.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(WRAPPED_SECRET_SIZE);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&self.params.to_bytes());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Decode from storage.
    ///
    /// # Errors
    ///
    /// Returns an error on a wrong length or unsupported version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != WRAPPED_SECRET_SIZE {
            return Err(CryptoError::InvalidKeyMaterial);
        }

        if bytes[0] != FORMAT_VERSION {
            return Err(CryptoError::InvalidParameter(format!(
                "unsupported format version: {}",
                bytes[0]
            )));
        }

        let mut params = [0u8; PARAMS_SIZE];
        params.copy_from_slice(&bytes[1..1 + PARAMS_SIZE]);

        let salt_start = 1 + PARAMS_SIZE;
        let nonce_start = salt_start + SALT_SIZE;
        let ct_start = nonce_start + NONCE_SIZE;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[salt_start..nonce_start]);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[nonce_start..ct_start]);

        Ok(Self {
            params: WrapParams::from_bytes(&params),
            salt,
            nonce,
            ciphertext: bytes[ct_start..].to_vec(),
        })
    }
}

fn derive_wrapping_key(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &WrapParams,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.argon2_params()?);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}
