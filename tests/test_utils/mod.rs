//! Test utilities for engine integration tests.
//!
//! Sets up an in-memory SQLite database with migrations applied, an engine
//! wired to in-memory queue and counter stores, and row fixtures for
//! projects, sources, endpoints and subscriptions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use courier::config::DeliveryConfig;
use courier::engine::Engine;
use courier::matcher::FilterConfig;
use courier::metrics::CapturingSink;
use courier::models::{endpoint, project, source, subscription};
use courier::notifier::{FailureAlert, Notifier, NotifyError};
use courier::queue::{DeliveryQueue, InMemoryDeliveryQueue, Lease};
use courier::rate_limiter::InMemoryCounterStore;
use courier::retry::RetryConfig;
use courier::signature::{SealedSecret, SignatureScheme};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(db))
}

/// Records alerts instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<FailureAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<FailureAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &FailureAlert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// An engine plus handles on its in-memory collaborators.
pub struct TestEngine {
    pub engine: Engine,
    pub queue: Arc<InMemoryDeliveryQueue>,
    pub metrics: Arc<CapturingSink>,
    pub notifier: Arc<RecordingNotifier>,
}

pub async fn test_engine() -> Result<TestEngine> {
    test_engine_with(DeliveryConfig::default()).await
}

pub async fn test_engine_with(delivery: DeliveryConfig) -> Result<TestEngine> {
    let db = setup_test_db().await?;
    let queue = Arc::new(InMemoryDeliveryQueue::new());
    let metrics = Arc::new(CapturingSink::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = Engine::builder(db)
        .delivery_config(delivery)
        .queue(queue.clone())
        .counter_store(Arc::new(InMemoryCounterStore::new()))
        .metrics(metrics.clone())
        .notifier(notifier.clone())
        .build()?;

    Ok(TestEngine {
        engine,
        queue,
        metrics,
        notifier,
    })
}

pub async fn insert_project(engine: &Engine, disable_endpoint: bool) -> Result<project::Model> {
    let now = Utc::now().fixed_offset();
    Ok(engine
        .repos
        .projects
        .create(project::Model {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            rate_limit_count: 0,
            rate_limit_duration: "1m".to_string(),
            disable_endpoint,
            created_at: now,
            updated_at: now,
        })
        .await?)
}

pub async fn insert_source(engine: &Engine, project_id: Uuid) -> Result<source::Model> {
    let now = Utc::now().fixed_offset();
    Ok(engine
        .repos
        .sources
        .create(source::Model {
            id: Uuid::new_v4(),
            project_id,
            name: "inbound".to_string(),
            verifier: json!({ "type": "noop" }),
            created_at: now,
            updated_at: now,
        })
        .await?)
}

/// An active endpoint model signing with `secrets` (sealed with the
/// engine's sealer). Tests adjust fields before inserting.
pub fn endpoint_model(
    engine: &Engine,
    project_id: Uuid,
    url: &str,
    secrets: &[&str],
) -> Result<endpoint::Model> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let sealed = secrets
        .iter()
        .map(|secret| {
            Ok(SealedSecret {
                uid: Uuid::new_v4().to_string(),
                value: engine.sealer.seal(id, secret)?,
                created_at: now,
                expires_at: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(endpoint::Model {
        id,
        project_id,
        name: "receiver".to_string(),
        url: url.to_string(),
        secrets: serde_json::to_value(sealed)?,
        signature: serde_json::to_value(SignatureScheme::default())?,
        headers: None,
        http_timeout_seconds: 5,
        status: "active".to_string(),
        disabled: false,
        failure_count: 0,
        rate_limit_count: 0,
        rate_limit_duration: "1m".to_string(),
        created_at: now.fixed_offset(),
        updated_at: now.fixed_offset(),
    })
}

pub async fn insert_endpoint(
    engine: &Engine,
    project_id: Uuid,
    url: &str,
    secrets: &[&str],
) -> Result<endpoint::Model> {
    let model = endpoint_model(engine, project_id, url, secrets)?;
    Ok(engine.repos.endpoints.create(model).await?)
}

/// An enabled outbound subscription model.
pub fn subscription_model(
    project_id: Uuid,
    endpoint_id: Uuid,
    event_types: &[&str],
    retry: RetryConfig,
) -> subscription::Model {
    let now = Utc::now().fixed_offset();
    subscription::Model {
        id: Uuid::new_v4(),
        project_id,
        source_id: None,
        endpoint_id,
        name: "subscription".to_string(),
        filter_config: serde_json::to_value(FilterConfig::for_types(event_types.iter().copied()))
            .unwrap(),
        retry_config: serde_json::to_value(retry).unwrap(),
        alert_config: None,
        rate_limit_config: None,
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

pub async fn insert_subscription(
    engine: &Engine,
    project_id: Uuid,
    endpoint_id: Uuid,
    event_types: &[&str],
    retry: RetryConfig,
) -> Result<subscription::Model> {
    let model = subscription_model(project_id, endpoint_id, event_types, retry);
    Ok(engine.repos.subscriptions.create(model).await?)
}

/// Promote everything due within the next day and lease one job, so tests
/// can step through retries without waiting on backoff delays.
pub async fn lease_next(queue: &dyn DeliveryQueue, consumer: &str) -> Result<Option<Lease>> {
    let horizon = Utc::now() + Duration::days(1);
    queue.promote_ready(horizon, 1_000).await?;
    Ok(queue
        .lease(consumer, std::time::Duration::from_secs(120), Utc::now())
        .await?)
}
