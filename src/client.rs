//! Client-held-key sealing for zero-knowledge pastes.
//!
//! The key is generated on the submitting machine and travels only in the URL
//! fragment of the share link. The server stores and returns the sealed
//! payload verbatim and has no way to open it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::server::crypto::{open_with_key, seal_with_key, CryptoError, KEY_LEN};
use crate::EncryptedPayload;

pub struct ClientKey(Zeroizing<[u8; KEY_LEN]>);

impl ClientKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut *key);
        Self(key)
    }

    /// Accepts the fragment with or without its leading `#`.
    pub fn from_fragment(fragment: &str) -> Result<Self, CryptoError> {
        let encoded = fragment.trim().trim_start_matches('#');
        let bytes = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(encoded.as_bytes())
                .map_err(|_| CryptoError::MalformedMaterial("client key encoding"))?,
        );
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::MalformedMaterial("client key length"))?;
        Ok(Self(Zeroizing::new(key)))
    }

    pub fn to_fragment(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0[..])
    }
}

/// Splits a share link into the part sent to the server and the key fragment.
pub fn split_share_url(url: &str) -> (&str, Option<&str>) {
    match url.split_once('#') {
        Some((base, fragment)) if !fragment.is_empty() => (base, Some(fragment)),
        Some((base, _)) => (base, None),
        None => (url, None),
    }
}

pub fn seal(plaintext: &str, key: &ClientKey) -> Result<EncryptedPayload, CryptoError> {
    seal_with_key(&key.0, plaintext.as_bytes(), Vec::new())
}

pub fn open(payload: &EncryptedPayload, key: &ClientKey) -> Result<String, CryptoError> {
    let bytes = open_with_key(&key.0, payload)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::MalformedMaterial("plaintext is not utf-8"))
}
