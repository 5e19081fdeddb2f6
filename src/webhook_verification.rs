//! # Inbound Webhook Verification
//!
//! Requests arriving at an inbound source are authenticated before an event
//! is admitted. Each source carries a [`VerifierConfig`]; the matching
//! [`Verifier`] checks the raw body and headers using constant-time
//! comparison. A failure is a hard rejection.

use axum::http::{HeaderMap, StatusCode};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::signature::{HashAlgorithm, SignatureEncoding};

/// Errors that can occur during inbound verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Verifier misconfigured: {reason}")]
    Misconfigured { reason: String },
}

impl VerificationError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            VerificationError::MissingSignature { .. }
            | VerificationError::InvalidSignatureFormat { .. }
            | VerificationError::VerificationFailed => StatusCode::UNAUTHORIZED,
            VerificationError::Misconfigured { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

/// Result type for inbound verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Stored verifier settings of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifierConfig {
    Noop,
    Hmac {
        header: String,
        #[serde(default)]
        hash: HashAlgorithm,
        #[serde(default)]
        encoding: SignatureEncoding,
        secret: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        key: String,
    },
}

impl VerifierConfig {
    /// Header carrying the caller's credential or signature, if the scheme
    /// uses one other than `Authorization`.
    pub fn credential_header(&self) -> Option<&str> {
        match self {
            VerifierConfig::Hmac { header, .. } | VerifierConfig::ApiKey { header, .. } => {
                Some(header.as_str())
            }
            VerifierConfig::Noop | VerifierConfig::BasicAuth { .. } => None,
        }
    }

    pub fn build(&self) -> Box<dyn Verifier> {
        match self.clone() {
            VerifierConfig::Noop => Box::new(NoopVerifier),
            VerifierConfig::Hmac {
                header,
                hash,
                encoding,
                secret,
            } => Box::new(HmacVerifier {
                header,
                hash,
                encoding,
                secret,
            }),
            VerifierConfig::BasicAuth { username, password } => {
                Box::new(BasicAuthVerifier { username, password })
            }
            VerifierConfig::ApiKey { header, key } => Box::new(ApiKeyVerifier { header, key }),
        }
    }
}

pub trait Verifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> VerificationResult<()>;
}

/// Accepts every request.
#[derive(Debug, Clone, Copy)]
pub struct NoopVerifier;

impl Verifier for NoopVerifier {
    fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> VerificationResult<()> {
        Ok(())
    }
}

/// HMAC over the raw body carried in a single header, optionally prefixed
/// (`sha256=<hex>` style prefixes are stripped).
#[derive(Debug, Clone)]
pub struct HmacVerifier {
    pub header: String,
    pub hash: HashAlgorithm,
    pub encoding: SignatureEncoding,
    pub secret: String,
}

impl HmacVerifier {
    fn expected(&self, body: &[u8]) -> VerificationResult<Vec<u8>> {
        let misconfigured = |_| VerificationError::Misconfigured {
            reason: "invalid HMAC secret".to_string(),
        };
        Ok(match self.hash {
            HashAlgorithm::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(self.secret.as_bytes()).map_err(misconfigured)?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(self.secret.as_bytes()).map_err(misconfigured)?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }
}

impl Verifier for HmacVerifier {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> VerificationResult<()> {
        debug!(body_size = body.len(), header = %self.header, "Verifying HMAC signature");

        let provided = header_str(headers, &self.header).ok_or_else(|| {
            VerificationError::MissingSignature {
                header: self.header.clone(),
            }
        })?;
        let provided = provided
            .split_once('=')
            .filter(|(prefix, _)| matches!(*prefix, "sha256" | "sha512"))
            .map(|(_, value)| value)
            .unwrap_or(provided);

        let provided_bytes = match self.encoding {
            SignatureEncoding::Hex => hex::decode(provided).ok(),
            SignatureEncoding::Base64 => STANDARD.decode(provided).ok(),
        }
        .ok_or_else(|| VerificationError::InvalidSignatureFormat {
            header: self.header.clone(),
        })?;

        let expected = self.expected(body)?;
        if bool::from(expected.as_slice().ct_eq(provided_bytes.as_slice())) {
            Ok(())
        } else {
            Err(VerificationError::VerificationFailed)
        }
    }
}

/// `Authorization: Basic <base64(username:password)>`.
#[derive(Debug, Clone)]
pub struct BasicAuthVerifier {
    pub username: String,
    pub password: String,
}

impl Verifier for BasicAuthVerifier {
    fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> VerificationResult<()> {
        let encoded = header_str(headers, "authorization")
            .and_then(|value| value.strip_prefix("Basic "))
            .ok_or_else(|| VerificationError::MissingSignature {
                header: "Authorization (Basic)".to_string(),
            })?;

        let decoded = STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| VerificationError::InvalidSignatureFormat {
                header: "Authorization".to_string(),
            })?;
        let (username, password) =
            decoded
                .split_once(':')
                .ok_or_else(|| VerificationError::InvalidSignatureFormat {
                    header: "Authorization".to_string(),
                })?;

        let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        if bool::from(user_ok & pass_ok) {
            Ok(())
        } else {
            Err(VerificationError::VerificationFailed)
        }
    }
}

/// A static key in a named header. `Bearer ` prefixes are accepted.
#[derive(Debug, Clone)]
pub struct ApiKeyVerifier {
    pub header: String,
    pub key: String,
}

impl Verifier for ApiKeyVerifier {
    fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> VerificationResult<()> {
        let provided = header_str(headers, &self.header).ok_or_else(|| {
            VerificationError::MissingSignature {
                header: self.header.clone(),
            }
        })?;
        let provided = provided.strip_prefix("Bearer ").unwrap_or(provided);

        if bool::from(provided.as_bytes().ct_eq(self.key.as_bytes())) {
            Ok(())
        } else {
            Err(VerificationError::VerificationFailed)
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
