//! # HTTP Dispatcher
//!
//! Sends one signed delivery to an endpoint and captures the outcome. Every
//! request has a hard timeout, redirects are never followed and response
//! bodies are truncated to the configured cap.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::models::{event, event_delivery};
use crate::signature::SignatureHeader;

pub const EVENT_ID_HEADER: &str = "X-Courier-Event-Id";
pub const DELIVERY_ID_HEADER: &str = "X-Courier-Delivery-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Courier-Event-Type";
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Courier-Idempotency-Key";

/// Everything needed to perform one HTTP attempt.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Captured result of one HTTP attempt.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub status: Option<u16>,
    pub response_headers: Option<JsonValue>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|status| (200..300).contains(&status))
    }

    /// Short description of a failed attempt for the delivery record.
    pub fn failure_reason(&self) -> String {
        match (&self.error, self.status) {
            (Some(error), _) => error.clone(),
            (None, Some(status)) => format!("endpoint responded with HTTP {status}"),
            (None, None) => "no response".to_string(),
        }
    }
}

/// Request headers for a delivery: standard headers, then the endpoint's
/// custom headers, then signatures. Later entries win on name clashes, so
/// custom headers cannot replace a signature.
pub fn delivery_headers(
    event: &event::Model,
    delivery: &event_delivery::Model,
    custom: &BTreeMap<String, String>,
    signatures: &[SignatureHeader],
) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        (EVENT_ID_HEADER.to_string(), event.id.to_string()),
        (DELIVERY_ID_HEADER.to_string(), delivery.id.to_string()),
        (EVENT_TYPE_HEADER.to_string(), event.event_type.clone()),
    ];
    if let Some(key) = &event.idempotency_key {
        headers.push((IDEMPOTENCY_KEY_HEADER.to_string(), key.clone()));
    }
    headers.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    headers.extend(
        signatures
            .iter()
            .map(|signature| (signature.name.clone(), signature.value.clone())),
    );
    headers
}

/// Headers as a JSON object for the attempt record.
pub fn headers_to_json(headers: &[(String, String)]) -> JsonValue {
    JsonValue::Object(
        headers
            .iter()
            .map(|(name, value)| (name.clone(), JsonValue::String(value.clone())))
            .collect(),
    )
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    max_timeout: Duration,
    default_timeout: Duration,
    max_body_bytes: usize,
}

impl Dispatcher {
    pub fn new(config: &DeliveryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.max_http_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            max_timeout: Duration::from_secs(config.max_http_timeout_seconds),
            default_timeout: Duration::from_secs(config.default_http_timeout_seconds),
            max_body_bytes: config.max_response_body_bytes,
        })
    }

    /// Effective timeout for an endpoint setting in seconds.
    pub fn timeout_for(&self, endpoint_timeout_seconds: i32) -> Duration {
        if endpoint_timeout_seconds <= 0 {
            return self.default_timeout;
        }
        Duration::from_secs(endpoint_timeout_seconds as u64).min(self.max_timeout)
    }

    pub async fn send(&self, request: DispatchRequest) -> DispatchOutcome {
        let started = Instant::now();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid outbound header"),
            }
        }

        let result = self
            .client
            .post(&request.url)
            .headers(headers)
            .timeout(request.timeout.min(self.max_timeout))
            .body(request.payload)
            .send()
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                let error = if err.is_timeout() {
                    format!("request timed out after {}s", request.timeout.as_secs())
                } else if err.is_connect() {
                    format!("connection failed: {err}")
                } else {
                    format!("request error: {err}")
                };
                debug!(url = %request.url, error = %error, "Dispatch failed");
                return DispatchOutcome {
                    error: Some(error),
                    elapsed: started.elapsed(),
                    ..Default::default()
                };
            }
        };

        let status = response.status().as_u16();
        let response_headers = JsonValue::Object(
            response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), JsonValue::String(v.to_string())))
                })
                .collect(),
        );

        let mut body = Vec::new();
        let mut error = None;
        while body.len() < self.max_body_bytes {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = self.max_body_bytes - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                }
                Ok(None) => break,
                Err(err) => {
                    error = Some(format!("failed reading response body: {err}"));
                    break;
                }
            }
        }

        DispatchOutcome {
            status: Some(status),
            response_headers: Some(response_headers),
            response_body: Some(String::from_utf8_lossy(&body).into_owned()),
            error: error.filter(|_| !(200..300).contains(&status)),
            elapsed: started.elapsed(),
        }
    }
}
