//! # Error Handling
//!
//! Engine-level error taxonomy and its problem+json rendering at the HTTP
//! surface.

use std::time::Duration;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::queue::QueueError;
use crate::repositories::StorageError;
use crate::telemetry;
use crate::webhook_verification::VerificationError;

/// Errors surfaced by engine operations.
///
/// Per-delivery dispatch failures never reach this type; the worker records
/// them on the delivery and its attempts instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Not retried: the request is refused outright.
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("retry budget exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// Not retried: the stored configuration cannot be used.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { entity, id }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            StorageError::Conflict(message) => EngineError::Conflict(message),
            other => EngineError::Storage(other),
        }
    }
}

/// Reasons an inbound event is refused.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("inbound verification failed: {0}")]
    Verification(#[from] VerificationError),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("rate limit exceeded; retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Verification(err) => {
                ApiError::new(err.status_code(), "UNAUTHORIZED", &err.to_string())
            }
            Rejection::Malformed(reason) => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &reason)
            }
            Rejection::RateLimited { retry_after } => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Project ingestion rate limit exceeded",
            )
            .with_retry_after(retry_after.as_secs().max(1)),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Rejected(rejection) => rejection.into(),
            EngineError::NotFound { entity, id } => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{entity} not found"),
            )
            .with_details(serde_json::json!({ "id": id })),
            EngineError::Conflict(message) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", &message)
            }
            EngineError::Configuration(message) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_CONFIGURATION", &message)
            }
            EngineError::Transient(_)
            | EngineError::Exhausted { .. }
            | EngineError::Queue(_)
            | EngineError::Storage(_) => {
                tracing::error!(error = %error, "Internal engine error");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "The delivery engine is temporarily unavailable",
                )
            }
        }
    }
}
