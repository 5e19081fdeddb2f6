//! SQL-backed delivery queue.
//!
//! Every message is a row in `delivery_queue` whose `state` column encodes
//! the structure it lives in: `delayed` (scheduling set, ordered by
//! `ready_at_ms`), `ready` (active stream, ordered by `promoted_at_ms`) or
//! `pending` (leased). State changes are claim-style updates filtered on the
//! previous state, so concurrent movers, leasers and reclaimers across
//! processes never double-claim a row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{DeliveryQueue, Lease, QueueJob, QueueResult, QueueStats, lease_expiry};
use crate::models::queue_message::{ActiveModel, Column, Entity as QueueMessage};

const STATE_DELAYED: &str = "delayed";
const STATE_READY: &str = "ready";
const STATE_PENDING: &str = "pending";

/// Lost claim races retried per `lease` call.
const MAX_LEASE_CONTENTION_RETRIES: usize = 5;

#[derive(Debug, Clone)]
pub struct SqlDeliveryQueue {
    db: Arc<DatabaseConnection>,
}

impl SqlDeliveryQueue {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn count_state(&self, state: &str) -> QueueResult<u64> {
        Ok(QueueMessage::find()
            .filter(Column::State.eq(state))
            .count(self.db.as_ref())
            .await?)
    }
}

#[async_trait]
impl DeliveryQueue for SqlDeliveryQueue {
    async fn enqueue(&self, job: QueueJob, not_before: DateTime<Utc>) -> QueueResult<()> {
        ActiveModel {
            id: Set(job.id),
            delivery_id: Set(job.delivery_id),
            project_id: Set(job.project_id),
            manual: Set(job.manual),
            state: Set(STATE_DELAYED.to_string()),
            ready_at_ms: Set(not_before.timestamp_millis()),
            promoted_at_ms: Set(None),
            consumer: Set(None),
            lease_token: Set(None),
            lease_expires_at_ms: Set(None),
            delivery_count: Set(0),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(self.db.as_ref())
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn promote_ready(&self, now: DateTime<Utc>, limit: u64) -> QueueResult<u64> {
        let now_ms = now.timestamp_millis();
        let txn = self.db.begin().await?;

        let due: Vec<Uuid> = QueueMessage::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::State.eq(STATE_DELAYED))
            .filter(Column::ReadyAtMs.lte(now_ms))
            .order_by_asc(Column::ReadyAtMs)
            .limit(limit)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .into_tuple()
            .all(&txn)
            .await?;

        if due.is_empty() {
            txn.commit().await?;
            return Ok(0);
        }

        let result = QueueMessage::update_many()
            .col_expr(Column::State, Expr::value(STATE_READY))
            .col_expr(Column::PromotedAtMs, Expr::value(now_ms))
            .filter(Column::Id.is_in(due))
            .filter(Column::State.eq(STATE_DELAYED))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        debug!(promoted = result.rows_affected, "Promoted due queue entries");
        Ok(result.rows_affected)
    }

    async fn lease(
        &self,
        consumer: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Lease>> {
        let expires_at = lease_expiry(now, lease_timeout);

        for _ in 0..MAX_LEASE_CONTENTION_RETRIES {
            let txn = self.db.begin().await?;

            let Some(candidate) = QueueMessage::find()
                .select_only()
                .column(Column::Id)
                .filter(Column::State.eq(STATE_READY))
                .order_by_asc(Column::PromotedAtMs)
                .order_by_asc(Column::ReadyAtMs)
                .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
                .into_tuple::<Uuid>()
                .one(&txn)
                .await?
            else {
                txn.commit().await?;
                return Ok(None);
            };

            let token = Uuid::new_v4();
            let claimed = QueueMessage::update_many()
                .col_expr(Column::State, Expr::value(STATE_PENDING))
                .col_expr(Column::Consumer, Expr::value(consumer))
                .col_expr(Column::LeaseToken, Expr::value(token))
                .col_expr(
                    Column::LeaseExpiresAtMs,
                    Expr::value(expires_at.timestamp_millis()),
                )
                .col_expr(
                    Column::DeliveryCount,
                    Expr::col(Column::DeliveryCount).add(1),
                )
                .filter(Column::Id.eq(candidate))
                .filter(Column::State.eq(STATE_READY))
                .exec(&txn)
                .await?;

            if claimed.rows_affected == 0 {
                // Another consumer won the race; try the next message.
                txn.rollback().await?;
                continue;
            }

            let row = QueueMessage::find_by_id(candidate).one(&txn).await?;
            txn.commit().await?;

            let Some(row) = row else {
                continue;
            };

            return Ok(Some(Lease {
                job: QueueJob {
                    id: row.id,
                    delivery_id: row.delivery_id,
                    project_id: row.project_id,
                    manual: row.manual,
                },
                token,
                consumer: consumer.to_string(),
                expires_at,
                delivery_count: row.delivery_count.max(0) as u32,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        let result = QueueMessage::delete_many()
            .filter(Column::Id.eq(lease.job.id))
            .filter(Column::State.eq(STATE_PENDING))
            .filter(Column::LeaseToken.eq(lease.token))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn reschedule(&self, lease: &Lease, not_before: DateTime<Utc>) -> QueueResult<bool> {
        let result = QueueMessage::update_many()
            .col_expr(Column::State, Expr::value(STATE_DELAYED))
            .col_expr(Column::ReadyAtMs, Expr::value(not_before.timestamp_millis()))
            .col_expr(Column::Manual, Expr::value(lease.job.manual))
            .col_expr(Column::PromotedAtMs, Expr::value(Option::<i64>::None))
            .col_expr(Column::Consumer, Expr::value(Option::<String>::None))
            .col_expr(Column::LeaseToken, Expr::value(Option::<Uuid>::None))
            .col_expr(Column::LeaseExpiresAtMs, Expr::value(Option::<i64>::None))
            .filter(Column::Id.eq(lease.job.id))
            .filter(Column::State.eq(STATE_PENDING))
            .filter(Column::LeaseToken.eq(lease.token))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let now_ms = now.timestamp_millis();
        let result = QueueMessage::update_many()
            .col_expr(Column::State, Expr::value(STATE_READY))
            .col_expr(Column::PromotedAtMs, Expr::value(now_ms))
            .col_expr(Column::Consumer, Expr::value(Option::<String>::None))
            .col_expr(Column::LeaseToken, Expr::value(Option::<Uuid>::None))
            .col_expr(Column::LeaseExpiresAtMs, Expr::value(Option::<i64>::None))
            .filter(Column::State.eq(STATE_PENDING))
            .filter(Column::LeaseExpiresAtMs.lte(now_ms))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected)
    }

    async fn cancel_waiting(&self, delivery_id: Uuid) -> QueueResult<u64> {
        let result = QueueMessage::delete_many()
            .filter(Column::DeliveryId.eq(delivery_id))
            .filter(Column::State.is_in([STATE_DELAYED, STATE_READY]))
            .exec(self.db.as_ref())
            .await?;

        Ok(result.rows_affected)
    }

    async fn tracks(&self, delivery_id: Uuid) -> QueueResult<bool> {
        let count = QueueMessage::find()
            .filter(Column::DeliveryId.eq(delivery_id))
            .count(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            scheduled: self.count_state(STATE_DELAYED).await?,
            ready: self.count_state(STATE_READY).await?,
            pending: self.count_state(STATE_PENDING).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};

    const LEASE: Duration = Duration::from_secs(120);

    async fn queue() -> SqlDeliveryQueue {
        let db = sea_orm::Database::connect("sqlite::memory:")
            .await
            .expect("connect sqlite");
        Migrator::up(&db, None).await.expect("apply migrations");
        SqlDeliveryQueue::new(Arc::new(db))
    }

    fn job() -> QueueJob {
        QueueJob::new(Uuid::new_v4(), Uuid::new_v4(), false)
    }

    #[tokio::test]
    async fn enqueue_promote_lease_ack() {
        let queue = queue().await;
        let now = Utc::now();
        let job = job();

        queue
            .enqueue(job, now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(queue.promote_ready(now, 100).await.unwrap(), 0);

        let due = now + chrono::Duration::seconds(10);
        assert_eq!(queue.promote_ready(due, 100).await.unwrap(), 1);

        let lease = queue.lease("worker-0", LEASE, due).await.unwrap().unwrap();
        assert_eq!(lease.job, job);
        assert_eq!(lease.delivery_count, 1);
        assert!(queue.lease("worker-1", LEASE, due).await.unwrap().is_none());

        assert_eq!(
            queue.stats().await.unwrap(),
            QueueStats {
                scheduled: 0,
                ready: 0,
                pending: 1
            }
        );

        assert!(queue.ack(&lease).await.unwrap());
        assert!(!queue.ack(&lease).await.unwrap());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn reclaim_hands_job_to_another_consumer() {
        let queue = queue().await;
        let now = Utc::now();
        queue.enqueue(job(), now).await.unwrap();
        queue.promote_ready(now, 10).await.unwrap();

        let crashed = queue.lease("crashed", LEASE, now).await.unwrap().unwrap();
        assert_eq!(queue.reclaim_expired(now).await.unwrap(), 0);
        assert_eq!(queue.reclaim_expired(crashed.expires_at).await.unwrap(), 1);

        let survivor = queue
            .lease("survivor", LEASE, crashed.expires_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(survivor.job.id, crashed.job.id);
        assert_eq!(survivor.delivery_count, 2);
        assert_ne!(survivor.token, crashed.token);

        assert!(!queue.ack(&crashed).await.unwrap());
        assert!(!queue.reschedule(&crashed, now).await.unwrap());
        assert!(queue.ack(&survivor).await.unwrap());
    }

    #[tokio::test]
    async fn reschedule_persists_manual_flag_and_score() {
        let queue = queue().await;
        let now = Utc::now();
        queue
            .enqueue(QueueJob::new(Uuid::new_v4(), Uuid::new_v4(), true), now)
            .await
            .unwrap();
        queue.promote_ready(now, 10).await.unwrap();

        let mut lease = queue.lease("c", LEASE, now).await.unwrap().unwrap();
        assert!(lease.job.manual);

        lease.job.manual = false;
        let retry_at = now + chrono::Duration::seconds(30);
        assert!(queue.reschedule(&lease, retry_at).await.unwrap());
        assert_eq!(queue.promote_ready(now, 10).await.unwrap(), 0);
        assert_eq!(queue.promote_ready(retry_at, 10).await.unwrap(), 1);

        let again = queue.lease("c", LEASE, retry_at).await.unwrap().unwrap();
        assert!(!again.job.manual);
        assert_eq!(again.job.id, lease.job.id);
    }

    #[tokio::test]
    async fn cancel_waiting_spares_leased_messages() {
        let queue = queue().await;
        let now = Utc::now();
        let delivery_id = Uuid::new_v4();
        let leased = QueueJob::new(delivery_id, Uuid::new_v4(), false);
        let waiting = QueueJob::new(delivery_id, Uuid::new_v4(), false);
        let unrelated = job();

        queue.enqueue(leased, now).await.unwrap();
        queue.promote_ready(now, 10).await.unwrap();
        let lease = queue.lease("c", LEASE, now).await.unwrap().unwrap();
        assert_eq!(lease.job, leased);

        queue.enqueue(waiting, now).await.unwrap();
        queue.enqueue(unrelated, now).await.unwrap();
        assert_eq!(queue.cancel_waiting(delivery_id).await.unwrap(), 1);
        assert!(queue.tracks(delivery_id).await.unwrap());

        assert!(queue.ack(&lease).await.unwrap());
        assert!(!queue.tracks(delivery_id).await.unwrap());
        assert!(queue.tracks(unrelated.delivery_id).await.unwrap());
    }
}
