//! # API Handlers
//!
//! Operational endpoints for the delivery engine plus the inbound ingestion
//! route.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::warn;

use crate::db;
use crate::error::ApiError;
use crate::queue::QueueStats;
use crate::server::AppState;

pub mod ingest;

pub use ingest::ingest_event;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Liveness: the process is up.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness: the database answers.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match db::health_check(state.db.as_ref()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready",
                version: env!("CARGO_PKG_VERSION"),
            }),
        ),
        Err(err) => {
            warn!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
        }
    }
}

/// Current queue depth.
pub async fn stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    let stats = state
        .engine
        .queue
        .stats()
        .await
        .map_err(|err| ApiError::from(crate::error::EngineError::from(err)))?;
    state.engine.metrics.queue_stats(&stats);
    Ok(Json(stats))
}

#[cfg(test)]
mod tests;
