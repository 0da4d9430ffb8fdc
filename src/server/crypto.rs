use std::fmt;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use super::config::ConfigError;
use crate::{EncryptedPayload, EncryptionMaterial};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext failed authentication")]
    AuthenticationFailed,
    #[error("malformed encryption material: {0}")]
    MalformedMaterial(&'static str),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("plaintext too large to encrypt")]
    PlaintextTooLong,
}

/// Server-held AES-256 key used when a paste is encrypted without a password.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ConfigError::MasterKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(key))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, ConfigError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|_| ConfigError::MasterKeyEncoding)?,
        );
        Self::from_bytes(&bytes)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Password hashing and server-side sealing. Holds no mutable state, so one
/// instance is shared across all requests.
#[derive(Debug)]
pub struct PasteCrypto {
    master_key: MasterKey,
    iterations: u32,
}

impl PasteCrypto {
    pub fn new(master_key: MasterKey, iterations: u32) -> Self {
        Self {
            master_key,
            iterations,
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Returns `hex(salt):hex(pbkdf2_sha256(password, salt))`.
    pub fn hash_password(&self, password: &str) -> Result<String, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let digest = derive_key(password, &salt, self.iterations)?;
        Ok(format!("{}:{}", hex::encode(salt), hex::encode(&digest[..])))
    }

    /// Constant-time check against a `salt:hash` string. Malformed input is a mismatch.
    pub fn verify_password(&self, password: &str, stored_hash: &str) -> bool {
        let Some((salt_hex, digest_hex)) = stored_hash.split_once(':') else {
            return false;
        };
        let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
            return false;
        };
        if salt.is_empty() || expected.len() != KEY_LEN {
            return false;
        }
        match derive_key(password, &salt, self.iterations) {
            Ok(derived) => derived[..].ct_eq(&expected[..]).into(),
            Err(_) => false,
        }
    }

    /// Seals `plaintext` under a password-derived key, or under the master key
    /// when no password is given. Every call draws a fresh salt and IV.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        password: Option<&str>,
    ) -> Result<EncryptedPayload, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        match password {
            Some(password) => {
                let key = derive_key(password, &salt, self.iterations)?;
                seal_with_key(&key, plaintext, salt.to_vec())
            }
            None => seal_with_key(&self.master_key.0, plaintext, salt.to_vec()),
        }
    }

    pub fn decrypt(
        &self,
        payload: &EncryptedPayload,
        password: Option<&str>,
    ) -> Result<Vec<u8>, CryptoError> {
        match password {
            Some(password) => {
                if payload.material.salt.is_empty() {
                    return Err(CryptoError::MalformedMaterial("missing salt"));
                }
                let key = derive_key(password, &payload.material.salt, self.iterations)?;
                open_with_key(&key, payload)
            }
            None => open_with_key(&self.master_key.0, payload),
        }
    }
}

fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut *key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

/// AES-256-GCM with a random 96-bit IV and the tag kept apart from the ciphertext.
pub(crate) fn seal_with_key(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    salt: Vec<u8>,
) -> Result<EncryptedPayload, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&Nonce::from(iv), b"", &mut buffer)
        .map_err(|_| CryptoError::PlaintextTooLong)?;

    Ok(EncryptedPayload {
        ciphertext: buffer,
        material: EncryptionMaterial {
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
            salt,
        },
    })
}

pub(crate) fn open_with_key(
    key: &[u8; KEY_LEN],
    payload: &EncryptedPayload,
) -> Result<Vec<u8>, CryptoError> {
    let iv: [u8; IV_LEN] = payload
        .material
        .iv
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::MalformedMaterial("iv length"))?;
    let tag: [u8; TAG_LEN] = payload
        .material
        .auth_tag
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::MalformedMaterial("auth tag length"))?;

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    let mut buffer = payload.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(&Nonce::from(iv), b"", &mut buffer, &Tag::from(tag))
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(buffer)
}
