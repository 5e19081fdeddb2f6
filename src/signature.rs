//! # Outbound Signatures
//!
//! HMAC signing of delivery payloads with multi-secret rotation and several
//! format versions per endpoint. Receivers use [`verify_signature`] (or an
//! equivalent) to check any one of the signatures they are sent.
//!
//! Simple mode emits one header per version: the first under the scheme's
//! header name, later ones with a `-V<n>` suffix, each holding the
//! comma-joined signatures of the payload under every active secret.
//! Advanced mode emits a single `t=<unix>,v1=<sig>,...,v2=<sig>` header where
//! every signature covers `"<unix>,<payload>"`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

use base64::{Engine as _, engine::general_purpose::STANDARD};

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Courier-Signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("endpoint has no active signing secret")]
    NoActiveSecret,
    #[error("signature scheme defines no versions")]
    NoVersions,
    #[error("invalid signing key")]
    InvalidKey,
    #[error("missing or malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignatureVersion {
    #[serde(default)]
    pub hash: HashAlgorithm,
    #[serde(default)]
    pub encoding: SignatureEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureScheme {
    #[serde(default = "default_header")]
    pub header: String,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default = "default_versions")]
    pub versions: Vec<SignatureVersion>,
}

impl Default for SignatureScheme {
    fn default() -> Self {
        Self {
            header: default_header(),
            advanced: false,
            versions: default_versions(),
        }
    }
}

fn default_header() -> String {
    DEFAULT_SIGNATURE_HEADER.to_string()
}

fn default_versions() -> Vec<SignatureVersion> {
    vec![SignatureVersion::default()]
}

impl SignatureScheme {
    /// Label recorded on attempts, e.g. `v1,v2`.
    pub fn version_label(&self) -> String {
        (1..=self.versions.len())
            .map(|n| format!("v{n}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A secret as persisted on the endpoint; `value` is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub uid: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SealedSecret {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// An opened secret ready for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub name: String,
    pub value: String,
}

/// HMAC of `message` under `key`, encoded per `version`.
pub fn compute(
    version: SignatureVersion,
    key: &[u8],
    message: &[u8],
) -> Result<String, SignatureError> {
    let digest = match version.hash {
        HashAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| SignatureError::InvalidKey)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(key).map_err(|_| SignatureError::InvalidKey)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
    };

    Ok(match version.encoding {
        SignatureEncoding::Hex => hex::encode(digest),
        SignatureEncoding::Base64 => STANDARD.encode(digest),
    })
}

/// Sign `payload` with every secret active at `now`.
pub fn sign(
    payload: &[u8],
    secrets: &[Secret],
    scheme: &SignatureScheme,
    now: DateTime<Utc>,
) -> Result<Vec<SignatureHeader>, SignatureError> {
    if scheme.versions.is_empty() {
        return Err(SignatureError::NoVersions);
    }

    let active: Vec<&Secret> = secrets.iter().filter(|s| s.is_active(now)).collect();
    if active.is_empty() {
        return Err(SignatureError::NoActiveSecret);
    }

    if scheme.advanced {
        let timestamp = now.timestamp();
        let mut message = format!("{timestamp},").into_bytes();
        message.extend_from_slice(payload);

        let mut parts = vec![format!("t={timestamp}")];
        for (index, version) in scheme.versions.iter().enumerate() {
            for secret in &active {
                let signature = compute(*version, secret.value.as_bytes(), &message)?;
                parts.push(format!("v{}={signature}", index + 1));
            }
        }

        return Ok(vec![SignatureHeader {
            name: scheme.header.clone(),
            value: parts.join(","),
        }]);
    }

    scheme
        .versions
        .iter()
        .enumerate()
        .map(|(index, version)| {
            let signatures = active
                .iter()
                .map(|secret| compute(*version, secret.value.as_bytes(), payload))
                .collect::<Result<Vec<_>, _>>()?;

            let name = if index == 0 {
                scheme.header.clone()
            } else {
                format!("{}-V{}", scheme.header, index + 1)
            };

            Ok(SignatureHeader {
                name,
                value: signatures.join(","),
            })
        })
        .collect()
}

/// Receiver-side check of one header value produced by [`sign`].
///
/// Simple mode accepts a value matching the first version; advanced mode
/// accepts any `v<n>` entry and rejects timestamps further than `tolerance`
/// from `now`.
pub fn verify_signature(
    header_value: &str,
    payload: &[u8],
    secret: &str,
    scheme: &SignatureScheme,
    tolerance: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let first = *scheme.versions.first().ok_or(SignatureError::NoVersions)?;

    if !scheme.advanced {
        let expected = compute(first, secret.as_bytes(), payload)?;
        let matched = header_value
            .split(',')
            .any(|candidate| constant_time_eq(candidate.trim(), &expected));
        return if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        };
    }

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header_value.split(',') {
        let (key, value) = part.trim().split_once('=').ok_or(SignatureError::Malformed)?;
        if key == "t" {
            timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?);
        } else if let Some(index) = key.strip_prefix('v') {
            let index: usize = index.parse().map_err(|_| SignatureError::Malformed)?;
            candidates.push((index, value));
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if (now.timestamp() - timestamp).abs() > tolerance.num_seconds() {
        return Err(SignatureError::Expired);
    }

    let mut message = format!("{timestamp},").into_bytes();
    message.extend_from_slice(payload);

    for (index, candidate) in candidates {
        let Some(version) = index.checked_sub(1).and_then(|i| scheme.versions.get(i)) else {
            continue;
        };
        let expected = compute(*version, secret.as_bytes(), &message)?;
        if constant_time_eq(candidate, &expected) {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap()
    }

    fn two_versions(advanced: bool) -> SignatureScheme {
        SignatureScheme {
            header: "X-Sig".to_string(),
            advanced,
            versions: vec![
                SignatureVersion {
                    hash: HashAlgorithm::Sha256,
                    encoding: SignatureEncoding::Hex,
                },
                SignatureVersion {
                    hash: HashAlgorithm::Sha512,
                    encoding: SignatureEncoding::Base64,
                },
            ],
        }
    }

    #[test]
    fn known_sha256_hex_vector() {
        // RFC 4231 test case 2
        let signature = compute(
            SignatureVersion::default(),
            b"Jefe",
            b"what do ya want for nothing?",
        )
        .unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn simple_mode_emits_header_per_version() {
        let secrets = vec![Secret::new("old"), Secret::new("new")];
        let headers = sign(b"{\"a\":1}", &secrets, &two_versions(false), now()).unwrap();

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].name, "X-Sig");
        assert_eq!(headers[1].name, "X-Sig-V2");
        assert_eq!(headers[0].value.split(',').count(), 2);
        assert_eq!(headers[1].value.split(',').count(), 2);
    }

    #[test]
    fn rotation_signs_with_old_and_new_until_expiry() {
        let payload = b"{\"event\":\"user.created\"}";
        let scheme = SignatureScheme::default();
        let secrets = vec![
            Secret {
                value: "old".to_string(),
                expires_at: Some(now() + Duration::hours(1)),
            },
            Secret::new("new"),
        ];

        let during = sign(payload, &secrets, &scheme, now()).unwrap();
        for secret in ["old", "new"] {
            verify_signature(&during[0].value, payload, secret, &scheme, Duration::minutes(5), now())
                .unwrap();
        }

        let after_expiry = now() + Duration::hours(2);
        let after = sign(payload, &secrets, &scheme, after_expiry).unwrap();
        assert!(
            verify_signature(&after[0].value, payload, "old", &scheme, Duration::minutes(5), after_expiry)
                .is_err()
        );
        verify_signature(&after[0].value, payload, "new", &scheme, Duration::minutes(5), after_expiry)
            .unwrap();
    }

    #[test]
    fn advanced_mode_binds_timestamp() {
        let scheme = two_versions(true);
        let payload = b"hello";
        let headers = sign(payload, &[Secret::new("s3cret")], &scheme, now()).unwrap();

        assert_eq!(headers.len(), 1);
        let value = &headers[0].value;
        assert!(value.starts_with(&format!("t={},v1=", now().timestamp())));
        assert!(value.contains(",v2="));

        verify_signature(value, payload, "s3cret", &scheme, Duration::minutes(5), now()).unwrap();
        assert_eq!(
            verify_signature(value, b"tampered", "s3cret", &scheme, Duration::minutes(5), now()),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(
                value,
                payload,
                "s3cret",
                &scheme,
                Duration::minutes(5),
                now() + Duration::minutes(10)
            ),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn no_active_secret_is_an_error() {
        let expired = Secret {
            value: "gone".to_string(),
            expires_at: Some(now() - Duration::seconds(1)),
        };
        assert_eq!(
            sign(b"x", &[expired], &SignatureScheme::default(), now()),
            Err(SignatureError::NoActiveSecret)
        );
        assert_eq!(
            sign(b"x", &[], &SignatureScheme::default(), now()),
            Err(SignatureError::NoActiveSecret)
        );
    }

    #[test]
    fn scheme_defaults_from_empty_json() {
        let scheme: SignatureScheme = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(scheme, SignatureScheme::default());
        assert_eq!(two_versions(false).version_label(), "v1,v2");
    }
}
