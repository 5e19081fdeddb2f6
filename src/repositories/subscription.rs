//! # Subscription Repository

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder,
};
use uuid::Uuid;

use super::{StorageResult, map_db_err, to_db_time};
use crate::models::subscription::{Column, Entity as Subscription, Model};

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>>;

    async fn create(&self, subscription: Model) -> StorageResult<Model>;

    /// Enabled subscriptions of a project. With a source id only that
    /// source's subscriptions are returned; without one only subscriptions
    /// that have no source.
    async fn find_enabled(
        &self,
        project_id: Uuid,
        source_id: Option<Uuid>,
    ) -> StorageResult<Vec<Model>>;

    /// Returns `false` when the subscription does not exist.
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> StorageResult<bool>;
}

#[derive(Debug, Clone)]
pub struct SeaSubscriptionRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaSubscriptionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriptionRepository for SeaSubscriptionRepository {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>> {
        Subscription::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find subscription", e))
    }

    async fn create(&self, subscription: Model) -> StorageResult<Model> {
        subscription
            .into_active_model()
            .reset_all()
            .insert(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("create subscription", e))
    }

    async fn find_enabled(
        &self,
        project_id: Uuid,
        source_id: Option<Uuid>,
    ) -> StorageResult<Vec<Model>> {
        let mut query = Subscription::find()
            .filter(Column::ProjectId.eq(project_id))
            .filter(Column::Enabled.eq(true))
            .order_by_asc(Column::CreatedAt);

        query = match source_id {
            Some(source_id) => query.filter(Column::SourceId.eq(source_id)),
            None => query.filter(Column::SourceId.is_null()),
        };

        query
            .all(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("list enabled subscriptions", e))
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> StorageResult<bool> {
        let result = Subscription::update_many()
            .col_expr(Column::Enabled, Expr::value(enabled))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("update subscription enabled flag", e))?;

        Ok(result.rows_affected > 0)
    }
}
