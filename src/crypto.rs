//! Endpoint secret sealing.
//!
//! Signing secrets are stored sealed in the endpoint's `secrets` column:
//! base64 of `0x01 || nonce(12) || AES-256-GCM ciphertext+tag`, with the
//! endpoint id as associated data so a sealed value copied onto another
//! endpoint fails to open. Anything without the marker byte is read as
//! plaintext, which is what an unkeyed sealer writes.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEALED_MARKER: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealing key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("failed to seal secret")]
    Seal,
    #[error("sealed secret is corrupt or bound to another endpoint")]
    Open,
    #[error("sealed secret is not valid base64")]
    Encoding,
    #[error("sealed secret is truncated")]
    Truncated,
    #[error("opened secret is not valid UTF-8")]
    NotUtf8,
    #[error("sealed secret found but no crypto key is configured")]
    MissingKey,
}

/// AES-256 key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey([u8; 32]);

impl SealingKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

/// Seals and opens endpoint secrets. Without a key, secrets are stored as
/// base64 plaintext; config validation only allows that on dev profiles.
#[derive(Debug, Clone, Default)]
pub struct SecretSealer {
    key: Option<SealingKey>,
}

impl SecretSealer {
    pub fn new(key: Option<SealingKey>) -> Self {
        Self { key }
    }

    pub fn from_config_key(raw: Option<&Vec<u8>>) -> Result<Self, CryptoError> {
        let key = raw.map(|bytes| SealingKey::from_slice(bytes)).transpose()?;
        Ok(Self { key })
    }

    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    pub fn seal(&self, endpoint_id: Uuid, plaintext: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(STANDARD.encode(plaintext));
        };

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let body = key
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: endpoint_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + body.len());
        sealed.push(SEALED_MARKER);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, endpoint_id: Uuid, sealed: &str) -> Result<String, CryptoError> {
        let bytes = STANDARD.decode(sealed).map_err(|_| CryptoError::Encoding)?;

        let plaintext = match bytes.first() {
            Some(&SEALED_MARKER) => {
                let key = self.key.as_ref().ok_or(CryptoError::MissingKey)?;
                if bytes.len() < HEADER_LEN + TAG_LEN {
                    return Err(CryptoError::Truncated);
                }
                let (header, body) = bytes.split_at(HEADER_LEN);
                key.cipher()
                    .decrypt(
                        Nonce::from_slice(&header[1..]),
                        Payload {
                            msg: body,
                            aad: endpoint_id.as_bytes(),
                        },
                    )
                    .map_err(|_| CryptoError::Open)?
            }
            _ => bytes,
        };

        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }
}
