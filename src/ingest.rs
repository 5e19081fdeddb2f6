//! # Event Ingestion
//!
//! Admits an event into the engine: validation, the project rate limit,
//! idempotency dedup, persistence, subscription matching and fan-out into
//! one delivery and one queue job per matched endpoint.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Rejection};
use crate::models::event_delivery::{self, DeliveryStatus};
use crate::models::event;
use crate::queue::QueueJob;
use crate::rate_limiter::project_key;
use crate::repositories::{StorageError, to_db_time};

const MAX_EVENT_TYPE_LEN: usize = 255;

/// A request to admit one event.
#[derive(Debug, Clone, Default)]
pub struct CreateEvent {
    pub project_id: Uuid,
    pub event_type: String,
    /// Raw body; must be JSON and is delivered verbatim
    pub payload: Vec<u8>,
    /// Set for events received through an inbound source
    pub source_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    /// Forwarded request headers, used by structural filters
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub event: event::Model,
    pub deliveries: Vec<event_delivery::Model>,
}

impl IngestResult {
    pub fn is_duplicate(&self) -> bool {
        self.event.is_duplicate
    }
}

impl CreateEvent {
    fn validate(&self) -> Result<(), Rejection> {
        let event_type = self.event_type.trim();
        if event_type.is_empty() {
            return Err(Rejection::Malformed("event type is required".to_string()));
        }
        if event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(Rejection::Malformed(format!(
                "event type exceeds {MAX_EVENT_TYPE_LEN} characters"
            )));
        }
        if self.payload.is_empty() {
            return Err(Rejection::Malformed("payload is empty".to_string()));
        }
        serde_json::from_slice::<JsonValue>(&self.payload)
            .map_err(|e| Rejection::Malformed(format!("payload is not valid JSON: {e}")))?;
        if self
            .idempotency_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(Rejection::Malformed(
                "idempotency key must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    fn headers_json(&self) -> Option<JsonValue> {
        if self.headers.is_empty() {
            return None;
        }
        Some(JsonValue::Object(
            self.headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), JsonValue::String(value.clone())))
                .collect(),
        ))
    }
}

/// Admit `request` and fan it out. Duplicates are stored with
/// `is_duplicate` set and produce no deliveries.
#[instrument(skip_all, fields(project_id = %request.project_id, event_type = %request.event_type))]
pub async fn create_event(engine: &Engine, request: CreateEvent) -> Result<IngestResult, EngineError> {
    if let Err(rejection) = request.validate() {
        engine.metrics.event_ingested("rejected", 0);
        return Err(rejection.into());
    }

    let project = engine
        .repos
        .projects
        .find_by_id(request.project_id)
        .await?
        .ok_or_else(|| EngineError::not_found("project", request.project_id))?;

    if let Some(source_id) = request.source_id {
        let source = engine.repos.sources.find_by_id(source_id).await?;
        if source.is_none_or(|source| source.project_id != project.id) {
            return Err(EngineError::not_found("source", source_id));
        }
    }

    let now = Utc::now();
    let decision = engine
        .rate_limiter
        .allow(&project_key(project.id), &project.ingest_rate_limit(), now)
        .await
        .map_err(|e| EngineError::Configuration(format!("project rate limit: {e}")))?;
    if !decision.permitted {
        engine.metrics.event_ingested("rate_limited", 0);
        return Err(Rejection::RateLimited {
            retry_after: decision.retry_after,
        }
        .into());
    }

    let is_duplicate = match request.idempotency_key.as_deref() {
        Some(key) => {
            engine
                .repos
                .events
                .exists_with_idempotency_key(project.id, key)
                .await?
        }
        None => false,
    };

    let candidate = event::Model {
        id: Uuid::new_v4(),
        project_id: project.id,
        source_id: request.source_id,
        event_type: request.event_type.trim().to_string(),
        idempotency_key: request.idempotency_key.clone(),
        headers: request.headers_json(),
        payload: request.payload,
        is_duplicate,
        created_at: to_db_time(now),
    };
    let event = match engine.repos.events.create(candidate.clone()).await {
        Ok(event) => event,
        // Lost the race to a concurrent request with the same key.
        Err(StorageError::Conflict(_)) if !is_duplicate && candidate.idempotency_key.is_some() => {
            engine
                .repos
                .events
                .create(event::Model {
                    is_duplicate: true,
                    ..candidate
                })
                .await?
        }
        Err(err) => return Err(err.into()),
    };

    if event.is_duplicate {
        info!(event_id = %event.id, "Duplicate event stored without fan-out");
        engine.metrics.event_ingested("duplicate", 0);
        return Ok(IngestResult {
            event,
            deliveries: Vec::new(),
        });
    }

    let targets = engine.matcher.match_event(&event).await?;

    let mut seen_endpoints = HashSet::new();
    let mut deliveries = Vec::new();
    for target in targets {
        if !seen_endpoints.insert(target.endpoint.id) {
            continue;
        }
        let retry_problem = match target.subscription.retry() {
            Ok(retry) => retry.validate().err().map(|e| e.to_string()),
            Err(err) => Some(err.to_string()),
        };
        if let Some(problem) = retry_problem {
            warn!(subscription_id = %target.subscription.id, error = %problem, "Subscription retry config is invalid");
        }

        let delivery = engine
            .repos
            .deliveries
            .create(event_delivery::Model {
                id: Uuid::new_v4(),
                project_id: project.id,
                event_id: event.id,
                endpoint_id: target.endpoint.id,
                subscription_id: target.subscription.id,
                source_id: event.source_id,
                status: DeliveryStatus::Scheduled.as_str().to_string(),
                retry_config: target.subscription.retry_config.clone(),
                attempt_count: 0,
                auto_attempt_count: 0,
                next_attempt_at: to_db_time(now),
                description: None,
                claimed_by: None,
                created_at: to_db_time(now),
                updated_at: to_db_time(now),
            })
            .await?;

        engine
            .queue
            .enqueue(QueueJob::new(delivery.id, project.id, false), now)
            .await?;
        deliveries.push(delivery);
    }

    info!(
        event_id = %event.id,
        deliveries = deliveries.len(),
        "Event ingested"
    );
    engine.metrics.event_ingested("accepted", deliveries.len());

    Ok(IngestResult { event, deliveries })
}
