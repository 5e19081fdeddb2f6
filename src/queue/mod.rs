//! # Delivery Queue
//!
//! Durable at-least-once work queue built from two structures:
//!
//! - a **scheduling set** ordered by ready-at score, where every job lands
//!   on enqueue and where retries wait out their backoff;
//! - an **active stream** that workers lease from. A lease makes the
//!   message pending for one consumer until it is acknowledged,
//!   rescheduled, or its lease expires and the reclaim sweep returns it to
//!   the stream.
//!
//! A background mover promotes due entries from the set into the stream.
//! Backends: [`SqlDeliveryQueue`] for multi-process deployments and
//! [`InMemoryDeliveryQueue`] for a single process and tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod memory;
pub mod sql;

pub use memory::InMemoryDeliveryQueue;
pub use sql::SqlDeliveryQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Database(#[from] DbErr),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// One unit of dispatch work: deliver `delivery_id` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueJob {
    pub id: Uuid,
    pub delivery_id: Uuid,
    pub project_id: Uuid,
    /// Triggered by a manual or forced resend
    pub manual: bool,
}

impl QueueJob {
    pub fn new(delivery_id: Uuid, project_id: Uuid, manual: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            delivery_id,
            project_id,
            manual,
        }
    }
}

/// Exclusive ownership of a pending message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job: QueueJob,
    pub token: Uuid,
    pub consumer: String,
    pub expires_at: DateTime<Utc>,
    /// Times the message has been leased, including this lease
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting in the scheduling set
    pub scheduled: u64,
    /// In the active stream, not leased
    pub ready: u64,
    /// Leased and not yet acknowledged
    pub pending: u64,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Add `job` to the scheduling set with score `not_before`.
    async fn enqueue(&self, job: QueueJob, not_before: DateTime<Utc>) -> QueueResult<()>;

    /// Move up to `limit` entries with score at or before `now` into the
    /// active stream. Returns how many moved.
    async fn promote_ready(&self, now: DateTime<Utc>, limit: u64) -> QueueResult<u64>;

    /// Claim the oldest message in the active stream for `consumer`.
    async fn lease(
        &self,
        consumer: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Lease>>;

    /// Remove the message. `false` when the lease was lost to a reclaim.
    async fn ack(&self, lease: &Lease) -> QueueResult<bool>;

    /// Atomically release the lease and put the job (as described by
    /// `lease.job`) back into the scheduling set at `not_before`.
    async fn reschedule(&self, lease: &Lease, not_before: DateTime<Utc>) -> QueueResult<bool>;

    /// Return messages whose lease expired at or before `now` to the active
    /// stream.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<u64>;

    /// Drop the delivery's messages that are not leased, from both the
    /// scheduling set and the active stream. Returns how many were removed.
    async fn cancel_waiting(&self, delivery_id: Uuid) -> QueueResult<u64>;

    /// Whether any message, leased or not, exists for the delivery.
    async fn tracks(&self, delivery_id: Uuid) -> QueueResult<bool>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Wait until work may be available or `timeout` elapses.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, lease_timeout: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(lease_timeout.as_millis().min(i64::MAX as u128) as i64)
}

/// Poll `lease` until a job arrives or `shutdown` fires. `Ok(None)` means
/// shutdown.
pub async fn lease_blocking(
    queue: &dyn DeliveryQueue,
    consumer: &str,
    lease_timeout: Duration,
    poll_interval: Duration,
    shutdown: &CancellationToken,
) -> QueueResult<Option<Lease>> {
    loop {
        if shutdown.is_cancelled() {
            return Ok(None);
        }

        if let Some(lease) = queue.lease(consumer, lease_timeout, Utc::now()).await? {
            return Ok(Some(lease));
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = queue.wait_for_work(poll_interval) => {}
        }
    }
}
