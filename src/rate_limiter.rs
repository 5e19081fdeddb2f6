//! # Rate Limiter
//!
//! Fixed-window admission control keyed by tenant (`project:<id>` at
//! ingestion, `endpoint:<id>` at dispatch). Counters live in a shared
//! [`CounterStore`] so several engine processes enforce one budget.
//! When the store fails, the configured failure policy decides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RateLimitFailurePolicy;
use crate::metrics::MetricsSink;
use crate::models::rate_limit_counter::{self, Column, Entity as RateLimitCounter};

/// A budget of `count` admissions per `duration` (e.g. `"1m"`, `"500ms"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub count: u32,
    pub duration: String,
}

impl RateLimit {
    pub fn new(count: u32, duration: impl Into<String>) -> Self {
        Self {
            count,
            duration: duration.into(),
        }
    }

    pub fn window(&self) -> Result<Duration, RateLimitError> {
        parse_duration(&self.duration)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("invalid rate limit duration '{0}'")]
    InvalidDuration(String),
    #[error("counter store unavailable: {0}")]
    Store(String),
}

/// Parse `"500ms"`, `"30s"`, `"1m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, RateLimitError> {
    let value = raw.trim();
    let invalid = || RateLimitError::InvalidDuration(raw.to_string());

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3_600),
        _ => return Err(invalid()),
    };

    if duration.is_zero() {
        return Err(invalid());
    }
    Ok(duration)
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub permitted: bool,
    /// Time until the current window closes; zero when permitted.
    pub retry_after: Duration,
}

impl Decision {
    pub fn permit() -> Self {
        Self {
            permitted: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            permitted: false,
            retry_after,
        }
    }
}

pub fn project_key(project_id: Uuid) -> String {
    format!("project:{project_id}")
}

pub fn endpoint_key(endpoint_id: Uuid) -> String {
    format!("endpoint:{endpoint_id}")
}

/// Shared fixed-window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `(key, window_start_ms)` and return the
    /// value after the increment.
    async fn increment(
        &self,
        key: &str,
        window_start_ms: i64,
        window_ms: i64,
    ) -> Result<u64, RateLimitError>;

    /// Drop counters whose window ended before `now_ms`.
    async fn purge_expired(&self, now_ms: i64) -> Result<u64, RateLimitError>;
}

/// Process-local counters for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<(String, i64), (u64, i64)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_start_ms: i64,
        window_ms: i64,
    ) -> Result<u64, RateLimitError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| RateLimitError::Store("counter map poisoned".to_string()))?;
        let entry = counters
            .entry((key.to_string(), window_start_ms))
            .or_insert((0, window_start_ms + window_ms));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64, RateLimitError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| RateLimitError::Store("counter map poisoned".to_string()))?;
        let before = counters.len();
        counters.retain(|_, (_, expires_at_ms)| *expires_at_ms > now_ms);
        Ok((before - counters.len()) as u64)
    }
}

/// Counters in the `rate_limit_counters` table, shared across processes.
#[derive(Debug, Clone)]
pub struct SqlCounterStore {
    db: Arc<DatabaseConnection>,
}

impl SqlCounterStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn store_err(err: sea_orm::DbErr) -> RateLimitError {
    RateLimitError::Store(err.to_string())
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_start_ms: i64,
        window_ms: i64,
    ) -> Result<u64, RateLimitError> {
        let txn = self.db.begin().await.map_err(store_err)?;

        let row = rate_limit_counter::ActiveModel {
            key: Set(key.to_string()),
            window_start_ms: Set(window_start_ms),
            count: Set(1),
            expires_at_ms: Set(window_start_ms + window_ms),
        };

        RateLimitCounter::insert(row)
            .on_conflict(
                OnConflict::columns([Column::Key, Column::WindowStartMs])
                    .value(
                        Column::Count,
                        Expr::col((RateLimitCounter, Column::Count)).add(1),
                    )
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await
            .map_err(store_err)?;

        let count = RateLimitCounter::find_by_id((key.to_string(), window_start_ms))
            .one(&txn)
            .await
            .map_err(store_err)?
            .map(|row| row.count.max(0) as u64)
            .unwrap_or(1);

        txn.commit().await.map_err(store_err)?;
        Ok(count)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64, RateLimitError> {
        let result = RateLimitCounter::delete_many()
            .filter(Column::ExpiresAtMs.lte(now_ms))
            .exec(self.db.as_ref())
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected)
    }
}

/// Admission gate consulted before ingestion and before each dispatch.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitFailurePolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        policy: RateLimitFailurePolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    /// Count one admission against `key`. A limit with `count == 0` is
    /// treated as unlimited.
    pub async fn allow(
        &self,
        key: &str,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> Result<Decision, RateLimitError> {
        if limit.count == 0 {
            return Ok(Decision::permit());
        }

        let window_ms = limit.window()?.as_millis().min(i64::MAX as u128) as i64;
        let now_ms = now.timestamp_millis();
        let window_start_ms = now_ms - now_ms.rem_euclid(window_ms);
        let retry_after = Duration::from_millis((window_start_ms + window_ms - now_ms) as u64);

        match self.store.increment(key, window_start_ms, window_ms).await {
            Ok(count) if count <= u64::from(limit.count) => Ok(Decision::permit()),
            Ok(count) => {
                debug!(key, count, limit = limit.count, "Rate limit exceeded");
                Ok(Decision::deny(retry_after))
            }
            Err(err) => {
                let policy = self.policy.to_string();
                warn!(key, error = %err, policy = %policy, "Rate limit counter store failed");
                match self.policy {
                    RateLimitFailurePolicy::Open => {
                        self.metrics.rate_limit_store_failure("open");
                        Ok(Decision::permit())
                    }
                    RateLimitFailurePolicy::Closed => {
                        self.metrics.rate_limit_store_failure("closed");
                        Ok(Decision::deny(retry_after))
                    }
                }
            }
        }
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RateLimitError> {
        self.store.purge_expired(now.timestamp_millis()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CapturingSink, NoopSink};
    use chrono::TimeZone;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _: &str, _: i64, _: i64) -> Result<u64, RateLimitError> {
            Err(RateLimitError::Store("connection refused".to_string()))
        }

        async fn purge_expired(&self, _: i64) -> Result<u64, RateLimitError> {
            Err(RateLimitError::Store("connection refused".to_string()))
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, policy: RateLimitFailurePolicy) -> RateLimiter {
        RateLimiter::new(store, policy, Arc::new(NoopSink))
    }

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[tokio::test]
    async fn denies_after_count_within_window() {
        let limiter = limiter(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitFailurePolicy::Open,
        );
        let limit = RateLimit::new(2, "1m");
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 10).unwrap();

        assert!(limiter.allow("project:a", &limit, now).await.unwrap().permitted);
        assert!(limiter.allow("project:a", &limit, now).await.unwrap().permitted);

        let denied = limiter.allow("project:a", &limit, now).await.unwrap();
        assert!(!denied.permitted);
        assert_eq!(denied.retry_after, Duration::from_secs(50));

        // Other keys keep their own budget.
        assert!(limiter.allow("project:b", &limit, now).await.unwrap().permitted);

        // The next window starts fresh.
        let later = now + chrono::Duration::seconds(60);
        assert!(limiter.allow("project:a", &limit, later).await.unwrap().permitted);
    }

    #[tokio::test]
    async fn zero_count_is_unlimited() {
        let limiter = limiter(Arc::new(FailingStore), RateLimitFailurePolicy::Closed);
        let decision = limiter
            .allow("endpoint:x", &RateLimit::new(0, "1m"), Utc::now())
            .await
            .unwrap();
        assert!(decision.permitted);
    }

    #[tokio::test]
    async fn store_failure_follows_policy() {
        let sink = Arc::new(CapturingSink::default());
        let open = RateLimiter::new(
            Arc::new(FailingStore),
            RateLimitFailurePolicy::Open,
            sink.clone(),
        );
        let closed = limiter(Arc::new(FailingStore), RateLimitFailurePolicy::Closed);
        let limit = RateLimit::new(10, "1s");

        assert!(open.allow("k", &limit, Utc::now()).await.unwrap().permitted);
        assert_eq!(sink.store_failures(), 1);
        assert!(!closed.allow("k", &limit, Utc::now()).await.unwrap().permitted);
    }

    #[tokio::test]
    async fn invalid_duration_is_an_error() {
        let limiter = limiter(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitFailurePolicy::Open,
        );
        let result = limiter
            .allow("k", &RateLimit::new(1, "soon"), Utc::now())
            .await;
        assert!(matches!(result, Err(RateLimitError::InvalidDuration(_))));
    }

    #[tokio::test]
    async fn purge_drops_closed_windows() {
        let store = InMemoryCounterStore::new();
        store.increment("k", 0, 1_000).await.unwrap();
        store.increment("k", 1_000, 1_000).await.unwrap();

        assert_eq!(store.purge_expired(1_500).await.unwrap(), 1);
        assert_eq!(store.increment("k", 1_000, 1_000).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sql_store_counts_across_calls() {
        use migration::{Migrator, MigratorTrait};

        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let store = SqlCounterStore::new(Arc::new(db));

        assert_eq!(store.increment("endpoint:e", 60_000, 60_000).await.unwrap(), 1);
        assert_eq!(store.increment("endpoint:e", 60_000, 60_000).await.unwrap(), 2);
        assert_eq!(store.increment("endpoint:e", 120_000, 60_000).await.unwrap(), 1);
        assert_eq!(store.purge_expired(120_000).await.unwrap(), 1);
    }
}
