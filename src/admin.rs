//! # Administrative Operations
//!
//! Tenant-triggered actions on deliveries and endpoints. Resends re-arm a
//! delivery to `scheduled` and enqueue a manual job; the worker records the
//! resulting attempt as manual so it does not consume the automatic retry
//! budget.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::endpoint;
use crate::models::event_delivery::{self, DeliveryStatus};
use crate::queue::QueueJob;
use crate::repositories::{DeliveryFilter, DeliveryUpdate, PageRequest};
use crate::signature::SealedSecret;

const SECRET_PREFIX: &str = "whsec_";
const GENERATED_SECRET_BYTES: usize = 32;

/// Aggregate outcome of a batch operation. One failing item never aborts
/// the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BatchResult {
    fn record(&mut self, id: Uuid, result: Result<event_delivery::Model, EngineError>) {
        match result {
            Ok(_) => self.succeeded += 1,
            Err(err) => {
                self.failed += 1;
                self.errors.push(format!("{id}: {err}"));
            }
        }
    }
}

/// Re-arm a delivery that is neither processing nor already successful.
#[instrument(skip(engine))]
pub async fn resend_delivery(
    engine: &Engine,
    delivery_id: Uuid,
) -> Result<event_delivery::Model, EngineError> {
    rearm(engine, delivery_id, false).await
}

/// Re-arm every listed delivery that is not currently processing,
/// including successful ones.
#[instrument(skip(engine), fields(count = delivery_ids.len()))]
pub async fn force_resend(engine: &Engine, delivery_ids: &[Uuid]) -> BatchResult {
    let mut result = BatchResult::default();
    for &id in delivery_ids {
        result.record(id, rearm(engine, id, true).await);
    }
    info!(
        succeeded = result.succeeded,
        failed = result.failed,
        "Force resend completed"
    );
    result
}

/// Resend every delivery matching `filter`. Without explicit statuses the
/// filter selects `failure` and `discarded` deliveries.
#[instrument(skip(engine, filter), fields(project_id = %filter.project_id))]
pub async fn batch_retry(
    engine: &Engine,
    mut filter: DeliveryFilter,
) -> Result<BatchResult, EngineError> {
    if filter.statuses.is_empty() {
        filter.statuses = vec![DeliveryStatus::Failure, DeliveryStatus::Discarded];
    }

    let mut result = BatchResult::default();
    let mut page = PageRequest::default();
    loop {
        let batch = engine.repos.deliveries.load_paged(&filter, page).await?;
        for delivery in &batch.items {
            result.record(delivery.id, rearm(engine, delivery.id, false).await);
        }

        match batch.next_cursor {
            Some(cursor) => page.after = Some(cursor),
            None => break,
        }
    }

    info!(
        succeeded = result.succeeded,
        failed = result.failed,
        "Batch retry completed"
    );
    Ok(result)
}

async fn rearm(
    engine: &Engine,
    delivery_id: Uuid,
    allow_success: bool,
) -> Result<event_delivery::Model, EngineError> {
    let repos = &engine.repos;
    let delivery = repos
        .deliveries
        .find_by_id(delivery_id)
        .await?
        .ok_or_else(|| EngineError::not_found("event delivery", delivery_id))?;

    let status = delivery
        .delivery_status()
        .map_err(EngineError::Configuration)?;
    match status {
        DeliveryStatus::Processing => {
            return Err(EngineError::Conflict(
                "delivery is currently being processed".to_string(),
            ));
        }
        DeliveryStatus::Success if !allow_success => {
            return Err(EngineError::Conflict(
                "delivery already succeeded; use a forced resend".to_string(),
            ));
        }
        _ => {}
    }

    let endpoint = repos
        .endpoints
        .find_by_id(delivery.endpoint_id)
        .await?
        .ok_or_else(|| EngineError::not_found("endpoint", delivery.endpoint_id))?;
    if endpoint.disabled {
        return Err(EngineError::Conflict(format!(
            "endpoint {} is disabled",
            endpoint.id
        )));
    }

    let now = Utc::now();
    let rearmed = repos
        .deliveries
        .update_status(
            delivery.id,
            &[status],
            DeliveryUpdate::status(DeliveryStatus::Scheduled)
                .with_next_attempt_at(now)
                .with_description("manual resend requested"),
        )
        .await?;
    if !rearmed {
        return Err(EngineError::Conflict(
            "delivery changed concurrently".to_string(),
        ));
    }

    // The manual job replaces any job still waiting. A job already leased
    // competes for the delivery claim, so only one of them dispatches.
    let replaced = engine.queue.cancel_waiting(delivery.id).await?;
    engine
        .queue
        .enqueue(QueueJob::new(delivery.id, delivery.project_id, true), now)
        .await?;

    info!(
        delivery_id = %delivery.id,
        previous = %status,
        replaced,
        "Delivery re-armed for manual resend"
    );

    repos
        .deliveries
        .find_by_id(delivery.id)
        .await?
        .ok_or_else(|| EngineError::not_found("event delivery", delivery.id))
}

/// Input for [`rotate_secret`].
#[derive(Debug, Clone)]
pub struct RotateSecret {
    /// New secret; generated when absent
    pub secret: Option<String>,
    /// How long currently active secrets keep signing
    pub grace_period: Duration,
}

#[derive(Debug, Clone)]
pub struct RotatedSecret {
    pub endpoint: endpoint::Model,
    pub uid: String,
    /// Plaintext of the new secret, returned once
    pub secret: String,
}

/// Add a new signing secret and schedule the current ones to expire after
/// the grace period. Already expired secrets are dropped.
#[instrument(skip(engine, request), fields(grace_s = request.grace_period.as_secs()))]
pub async fn rotate_secret(
    engine: &Engine,
    endpoint_id: Uuid,
    request: RotateSecret,
) -> Result<RotatedSecret, EngineError> {
    let endpoint = engine
        .repos
        .endpoints
        .find_by_id(endpoint_id)
        .await?
        .ok_or_else(|| EngineError::not_found("endpoint", endpoint_id))?;

    let now = Utc::now();
    let grace_ends =
        now + chrono::Duration::seconds(request.grace_period.as_secs().min(i64::MAX as u64) as i64);

    let mut secrets: Vec<SealedSecret> = endpoint
        .sealed_secrets()
        .map_err(|e| EngineError::Configuration(format!("invalid endpoint secrets: {e}")))?
        .into_iter()
        .filter(|secret| secret.is_active(now))
        .map(|mut secret| {
            if secret.expires_at.is_none_or(|expires_at| expires_at > grace_ends) {
                secret.expires_at = Some(grace_ends);
            }
            secret
        })
        .collect();

    let plaintext = match request.secret {
        Some(secret) if !secret.trim().is_empty() => secret,
        Some(_) => {
            return Err(EngineError::Configuration(
                "secret must not be blank".to_string(),
            ));
        }
        None => generate_secret(),
    };

    let uid = Uuid::new_v4().to_string();
    let sealed = engine
        .sealer
        .seal(endpoint.id, &plaintext)
        .map_err(|e| EngineError::Configuration(format!("failed to seal secret: {e}")))?;
    secrets.push(SealedSecret {
        uid: uid.clone(),
        value: sealed,
        created_at: now,
        expires_at: None,
    });

    let endpoint = engine
        .repos
        .endpoints
        .update_secrets(endpoint.id, &secrets)
        .await?;

    info!(endpoint_id = %endpoint.id, secret_uid = %uid, active = secrets.len(), "Rotated endpoint secret");

    Ok(RotatedSecret {
        endpoint,
        uid,
        secret: plaintext,
    })
}

/// Stop all deliveries to the endpoint until it is enabled again.
#[instrument(skip(engine))]
pub async fn disable_endpoint(
    engine: &Engine,
    endpoint_id: Uuid,
) -> Result<endpoint::Model, EngineError> {
    let endpoint = engine.repos.endpoints.set_disabled(endpoint_id, true).await?;
    warn!(endpoint_id = %endpoint.id, "Endpoint disabled by tenant");
    Ok(endpoint)
}

/// Re-enable an endpoint; its health starts over as `active`.
#[instrument(skip(engine))]
pub async fn enable_endpoint(
    engine: &Engine,
    endpoint_id: Uuid,
) -> Result<endpoint::Model, EngineError> {
    let endpoint = engine
        .repos
        .endpoints
        .set_disabled(endpoint_id, false)
        .await?;
    info!(endpoint_id = %endpoint.id, "Endpoint enabled by tenant");
    Ok(endpoint)
}

fn generate_secret() -> String {
    let mut bytes = [0u8; GENERATED_SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}
