//! # Ingestion Handler
//!
//! `POST /ingest/{source_id}`: authenticates the request with the source's
//! verifier, then admits the raw body as an event.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::{EVENT_TYPE_HEADER, IDEMPOTENCY_KEY_HEADER};
use crate::error::{ApiError, EngineError, Rejection};
use crate::ingest::{CreateEvent, create_event};
use crate::server::AppState;
use crate::webhook_verification::VerificationError;

/// Headers never copied onto the stored event.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "content-length",
    "host",
    "connection",
    "transfer-encoding",
];

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: Uuid,
    pub duplicate: bool,
    pub deliveries: usize,
}

pub async fn ingest_event(
    State(state): State<AppState>,
    Path(source_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let source = state
        .engine
        .repos
        .sources
        .find_by_id(source_id)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| EngineError::not_found("source", source_id))?;

    let verifier = source.verifier_config().map_err(|err| {
        warn!(source_id = %source.id, error = %err, "Source verifier config is invalid");
        ApiError::from(Rejection::Verification(VerificationError::Misconfigured {
            reason: "verifier configuration is unreadable".to_string(),
        }))
    })?;

    if let Err(err) = verifier.build().verify(&headers, &body) {
        warn!(source_id = %source.id, error = %err, "Inbound verification failed");
        return Err(Rejection::Verification(err).into());
    }

    let event_type = event_type(&headers, &body).ok_or_else(|| {
        ApiError::from(Rejection::Malformed(format!(
            "event type missing; send {EVENT_TYPE_HEADER} or an `event_type` field"
        )))
    })?;

    let request = CreateEvent {
        project_id: source.project_id,
        event_type,
        payload: body.to_vec(),
        source_id: Some(source.id),
        idempotency_key: header_str(&headers, IDEMPOTENCY_KEY_HEADER)
            .or_else(|| header_str(&headers, "Idempotency-Key")),
        headers: forwarded_headers(&headers, verifier.credential_header()),
    };

    let result = create_event(&state.engine, request).await?;
    info!(
        source_id = %source.id,
        event_id = %result.event.id,
        deliveries = result.deliveries.len(),
        "Inbound event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            event_id: result.event.id,
            duplicate: result.is_duplicate(),
            deliveries: result.deliveries.len(),
        }),
    ))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Event type from the header, falling back to a top-level `event_type`
/// string in the JSON body.
fn event_type(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    header_str(headers, EVENT_TYPE_HEADER).or_else(|| {
        serde_json::from_slice::<JsonValue>(body)
            .ok()?
            .get("event_type")?
            .as_str()
            .map(str::to_string)
    })
}

/// Request headers worth keeping on the event, minus transport headers and
/// the source's own credential header.
fn forwarded_headers(headers: &HeaderMap, credential: Option<&str>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.as_str()))
        .filter(|(name, _)| credential.is_none_or(|c| !name.as_str().eq_ignore_ascii_case(c.trim())))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn event_type_prefers_header() {
        let mut headers = HeaderMap::new();
        let body = br#"{"event_type":"from.body"}"#;
        assert_eq!(event_type(&headers, body).as_deref(), Some("from.body"));

        headers.insert(EVENT_TYPE_HEADER, HeaderValue::from_static("from.header"));
        assert_eq!(event_type(&headers, body).as_deref(), Some("from.header"));

        assert!(event_type(&HeaderMap::new(), b"{}").is_none());
    }

    #[test]
    fn credentials_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer x"));
        headers.insert("x-api-key", HeaderValue::from_static("k-123"));
        headers.insert("x-region", HeaderValue::from_static("eu"));

        let forwarded = forwarded_headers(&headers, Some("X-Api-Key"));
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get("x-region").map(String::as_str), Some("eu"));

        assert!(forwarded_headers(&headers, None).contains_key("x-api-key"));
    }
}
