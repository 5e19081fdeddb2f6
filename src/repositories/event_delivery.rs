//! # EventDelivery Repository
//!
//! Status changes are conditional updates filtered on the statuses the
//! caller expects, so a job reclaimed from a crashed worker can never move a
//! delivery backwards. Attempts are appended in the same transaction that
//! bumps the delivery counters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{Page, PageRequest, StorageError, StorageResult, map_db_err, to_db_time};
use crate::models::delivery_attempt::{
    self, ActiveModel as AttemptActiveModel, Entity as DeliveryAttempt,
};
use crate::models::event_delivery::{Column, DeliveryStatus, Entity as EventDelivery, Model};

/// Fields written by a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Replaces the stored description when set.
    pub description: Option<String>,
}

impl DeliveryUpdate {
    pub fn status(status: DeliveryStatus) -> Self {
        Self {
            status,
            next_attempt_at: None,
            description: None,
        }
    }

    pub fn with_next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One HTTP try, as captured by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct NewDeliveryAttempt {
    pub manual: bool,
    pub url: String,
    pub method: String,
    pub request_headers: JsonValue,
    pub signature_version: Option<String>,
    pub response_status: Option<u16>,
    pub response_headers: Option<JsonValue>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Criteria for listing deliveries. Empty vectors do not constrain.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub project_id: Uuid,
    pub statuses: Vec<DeliveryStatus>,
    pub endpoint_ids: Vec<Uuid>,
    pub event_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl DeliveryFilter {
    pub fn for_project(project_id: Uuid) -> Self {
        Self {
            project_id,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait EventDeliveryRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>>;

    async fn create(&self, delivery: Model) -> StorageResult<Model>;

    /// Apply `update` only if the delivery is currently in one of `from`.
    /// Returns whether the row changed.
    async fn update_status(
        &self,
        id: Uuid,
        from: &[DeliveryStatus],
        update: DeliveryUpdate,
    ) -> StorageResult<bool>;

    /// Move the delivery to `processing` on behalf of queue job `job_id`.
    /// Taken from `scheduled` or `retry`, or re-taken by the job that
    /// already holds it after its lease was reclaimed. `false` when another
    /// job owns the delivery or it has settled.
    async fn claim(&self, id: Uuid, job_id: Uuid) -> StorageResult<bool>;

    /// Append an attempt and bump the attempt counters. Manual attempts do
    /// not count against the automatic budget.
    async fn record_attempt(
        &self,
        delivery_id: Uuid,
        attempt: NewDeliveryAttempt,
    ) -> StorageResult<delivery_attempt::Model>;

    /// Deliveries still waiting for dispatch whose next attempt was due at
    /// or before `due_before`, oldest first.
    async fn find_stranded(
        &self,
        due_before: DateTime<Utc>,
        limit: u64,
    ) -> StorageResult<Vec<Model>>;

    async fn list_attempts(&self, delivery_id: Uuid) -> StorageResult<Vec<delivery_attempt::Model>>;

    async fn load_paged(
        &self,
        filter: &DeliveryFilter,
        page: PageRequest,
    ) -> StorageResult<Page<Model>>;
}

#[derive(Debug, Clone)]
pub struct SeaEventDeliveryRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaEventDeliveryRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventDeliveryRepository for SeaEventDeliveryRepository {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>> {
        EventDelivery::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find event delivery", e))
    }

    async fn create(&self, delivery: Model) -> StorageResult<Model> {
        delivery
            .into_active_model()
            .reset_all()
            .insert(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("create event delivery", e))
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: &[DeliveryStatus],
        update: DeliveryUpdate,
    ) -> StorageResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut query = EventDelivery::update_many()
            .col_expr(Column::Status, Expr::value(update.status.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())));

        if let Some(next_attempt_at) = update.next_attempt_at {
            query = query.col_expr(Column::NextAttemptAt, Expr::value(to_db_time(next_attempt_at)));
        }
        if let Some(description) = update.description {
            query = query.col_expr(Column::Description, Expr::value(description));
        }

        let result = query
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in(from.iter().map(|s| s.as_str())))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("update event delivery status", e))?;

        Ok(result.rows_affected > 0)
    }

    async fn claim(&self, id: Uuid, job_id: Uuid) -> StorageResult<bool> {
        let claimable = DeliveryStatus::claimable().iter().map(|s| s.as_str());
        let result = EventDelivery::update_many()
            .col_expr(
                Column::Status,
                Expr::value(DeliveryStatus::Processing.as_str()),
            )
            .col_expr(Column::ClaimedBy, Expr::value(job_id))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .filter(
                Condition::any().add(Column::Status.is_in(claimable)).add(
                    Condition::all()
                        .add(Column::Status.eq(DeliveryStatus::Processing.as_str()))
                        .add(Column::ClaimedBy.eq(job_id)),
                ),
            )
            .exec(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("claim event delivery", e))?;

        Ok(result.rows_affected > 0)
    }

    async fn find_stranded(
        &self,
        due_before: DateTime<Utc>,
        limit: u64,
    ) -> StorageResult<Vec<Model>> {
        EventDelivery::find()
            .filter(
                Column::Status.is_in(DeliveryStatus::claimable().iter().map(|s| s.as_str())),
            )
            .filter(Column::NextAttemptAt.lte(to_db_time(due_before)))
            .order_by_asc(Column::NextAttemptAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find stranded event deliveries", e))
    }

    async fn record_attempt(
        &self,
        delivery_id: Uuid,
        attempt: NewDeliveryAttempt,
    ) -> StorageResult<delivery_attempt::Model> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| map_db_err("begin attempt transaction", e))?;

        let mut bump = EventDelivery::update_many()
            .col_expr(
                Column::AttemptCount,
                Expr::col(Column::AttemptCount).add(1),
            )
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())));
        if !attempt.manual {
            bump = bump.col_expr(
                Column::AutoAttemptCount,
                Expr::col(Column::AutoAttemptCount).add(1),
            );
        }

        let bumped = bump
            .filter(Column::Id.eq(delivery_id))
            .exec(&txn)
            .await
            .map_err(|e| map_db_err("bump attempt counters", e))?;
        if bumped.rows_affected == 0 {
            return Err(StorageError::NotFound {
                entity: "event delivery",
                id: delivery_id,
            });
        }

        let attempt_number: i32 = EventDelivery::find_by_id(delivery_id)
            .select_only()
            .column(Column::AttemptCount)
            .into_tuple()
            .one(&txn)
            .await
            .map_err(|e| map_db_err("read attempt counter", e))?
            .ok_or(StorageError::NotFound {
                entity: "event delivery",
                id: delivery_id,
            })?;

        let record = AttemptActiveModel {
            id: Set(Uuid::new_v4()),
            delivery_id: Set(delivery_id),
            attempt_number: Set(attempt_number),
            manual: Set(attempt.manual),
            url: Set(attempt.url),
            method: Set(attempt.method),
            request_headers: Set(attempt.request_headers),
            signature_version: Set(attempt.signature_version),
            response_status: Set(attempt.response_status.map(i32::from)),
            response_headers: Set(attempt.response_headers),
            response_body: Set(attempt.response_body),
            error: Set(attempt.error),
            duration_ms: Set(attempt.duration_ms),
            created_at: Set(to_db_time(Utc::now())),
        }
        .insert(&txn)
        .await
        .map_err(|e| map_db_err("insert delivery attempt", e))?;

        txn.commit()
            .await
            .map_err(|e| map_db_err("commit attempt transaction", e))?;

        Ok(record)
    }

    async fn list_attempts(&self, delivery_id: Uuid) -> StorageResult<Vec<delivery_attempt::Model>> {
        DeliveryAttempt::find()
            .filter(delivery_attempt::Column::DeliveryId.eq(delivery_id))
            .order_by_asc(delivery_attempt::Column::AttemptNumber)
            .all(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("list delivery attempts", e))
    }

    async fn load_paged(
        &self,
        filter: &DeliveryFilter,
        page: PageRequest,
    ) -> StorageResult<Page<Model>> {
        let limit = page.effective_limit();
        let mut query = EventDelivery::find()
            .filter(Column::ProjectId.eq(filter.project_id))
            .order_by_asc(Column::Id)
            .limit(limit);

        if !filter.statuses.is_empty() {
            query = query.filter(Column::Status.is_in(filter.statuses.iter().map(|s| s.as_str())));
        }
        if !filter.endpoint_ids.is_empty() {
            query = query.filter(Column::EndpointId.is_in(filter.endpoint_ids.iter().copied()));
        }
        if let Some(event_id) = filter.event_id {
            query = query.filter(Column::EventId.eq(event_id));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(Column::CreatedAt.gte(to_db_time(after)));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(Column::CreatedAt.lt(to_db_time(before)));
        }
        if let Some(cursor) = page.after {
            query = query.filter(Column::Id.gt(cursor));
        }

        let rows = query
            .all(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("list event deliveries", e))?;

        Ok(Page::from_rows(rows, limit, |row| row.id))
    }
}
