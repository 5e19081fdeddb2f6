//! # Engine Wiring
//!
//! [`Engine`] bundles the shared collaborators every delivery component
//! needs. It is cheap to clone; all heavy state sits behind `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;
use thiserror::Error;
use tracing::info;

use crate::config::{AppConfig, DeliveryConfig, RateLimitFailurePolicy, StoreBackend};
use crate::crypto::{CryptoError, SecretSealer};
use crate::dispatcher::Dispatcher;
use crate::health::HealthTracker;
use crate::matcher::SubscriptionMatcher;
use crate::metrics::{MetricsSink, NoopSink, RecorderSink};
use crate::notifier::{LogNotifier, Notifier, NotifyError, WebhookNotifier};
use crate::queue::{DeliveryQueue, InMemoryDeliveryQueue, SqlDeliveryQueue};
use crate::rate_limiter::{CounterStore, InMemoryCounterStore, RateLimiter, SqlCounterStore};
use crate::repositories::Repositories;

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineInitError {
    #[error("failed to build dispatch client: {0}")]
    Dispatcher(#[from] reqwest::Error),
    #[error("invalid secret sealing key: {0}")]
    Crypto(#[from] CryptoError),
    #[error("invalid alert notifier: {0}")]
    Notifier(#[from] NotifyError),
}

#[derive(Clone)]
pub struct Engine {
    pub repos: Repositories,
    pub queue: Arc<dyn DeliveryQueue>,
    pub rate_limiter: RateLimiter,
    pub matcher: SubscriptionMatcher,
    pub health: HealthTracker,
    pub dispatcher: Dispatcher,
    pub sealer: SecretSealer,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: Arc<DeliveryConfig>,
}

impl Engine {
    pub fn builder(db: Arc<DatabaseConnection>) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    pub fn from_config(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
    ) -> Result<Self, EngineInitError> {
        let queue: Arc<dyn DeliveryQueue> = match config.queue_backend {
            StoreBackend::Database => Arc::new(SqlDeliveryQueue::new(db.clone())),
            StoreBackend::Memory => Arc::new(InMemoryDeliveryQueue::new()),
        };
        let counters: Arc<dyn CounterStore> = match config.rate_limit.backend {
            StoreBackend::Database => Arc::new(SqlCounterStore::new(db.clone())),
            StoreBackend::Memory => Arc::new(InMemoryCounterStore::new()),
        };
        let notifier: Arc<dyn Notifier> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url, ALERT_TIMEOUT)?),
            None => Arc::new(LogNotifier),
        };

        let sealer = SecretSealer::from_config_key(config.crypto_key.as_ref())?;

        info!(
            queue_backend = ?config.queue_backend,
            rate_limit_backend = ?config.rate_limit.backend,
            failure_policy = %config.rate_limit.failure_policy,
            workers = config.delivery.worker_count,
            secrets_sealed = sealer.is_keyed(),
            "Building delivery engine"
        );

        EngineBuilder::new(db)
            .delivery_config(config.delivery.clone())
            .failure_policy(config.rate_limit.failure_policy)
            .queue(queue)
            .counter_store(counters)
            .notifier(notifier)
            .metrics(Arc::new(RecorderSink))
            .sealer(sealer)
            .build()
    }
}

/// Assembles an [`Engine`]. Unset collaborators default to the SQL queue
/// and counter store, a log-only notifier, a no-op metrics sink and an
/// unkeyed secret sealer.
pub struct EngineBuilder {
    db: Arc<DatabaseConnection>,
    delivery: DeliveryConfig,
    failure_policy: RateLimitFailurePolicy,
    queue: Option<Arc<dyn DeliveryQueue>>,
    counters: Option<Arc<dyn CounterStore>>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
    sealer: SecretSealer,
}

impl EngineBuilder {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            delivery: DeliveryConfig::default(),
            failure_policy: RateLimitFailurePolicy::default(),
            queue: None,
            counters: None,
            notifier: Arc::new(LogNotifier),
            metrics: Arc::new(NoopSink),
            sealer: SecretSealer::default(),
        }
    }

    pub fn delivery_config(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn failure_policy(mut self, policy: RateLimitFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn counter_store(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn sealer(mut self, sealer: SecretSealer) -> Self {
        self.sealer = sealer;
        self
    }

    pub fn build(self) -> Result<Engine, EngineInitError> {
        let repos = Repositories::sea_orm(self.db.clone());
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(SqlDeliveryQueue::new(self.db.clone())));
        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(SqlCounterStore::new(self.db.clone())));

        Ok(Engine {
            matcher: SubscriptionMatcher::new(repos.subscriptions.clone(), repos.endpoints.clone()),
            health: HealthTracker::new(repos.endpoints.clone(), self.metrics.clone()),
            rate_limiter: RateLimiter::new(counters, self.failure_policy, self.metrics.clone()),
            dispatcher: Dispatcher::new(&self.delivery)?,
            repos,
            queue,
            sealer: self.sealer,
            notifier: self.notifier,
            metrics: self.metrics,
            config: Arc::new(self.delivery),
        })
    }
}
