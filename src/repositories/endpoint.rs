//! # Endpoint Repository
//!
//! Health updates are conditional on the health the caller observed, so
//! concurrent workers reporting on the same endpoint never lose a failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use super::{Page, PageRequest, StorageError, StorageResult, map_db_err, to_db_time};
use crate::health::EndpointHealth;
use crate::models::endpoint::{ActiveModel, Column, Entity as Endpoint, Model};
use crate::signature::SealedSecret;

#[async_trait]
pub trait EndpointRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>>;

    async fn create(&self, endpoint: Model) -> StorageResult<Model>;

    /// Move the endpoint from `expected` to `next`. Returns `false` when the
    /// stored health no longer matches `expected`.
    async fn update_status(
        &self,
        id: Uuid,
        expected: EndpointHealth,
        next: EndpointHealth,
    ) -> StorageResult<bool>;

    /// Explicit tenant disable. Enabling also resets health to active.
    async fn set_disabled(&self, id: Uuid, disabled: bool) -> StorageResult<Model>;

    async fn update_secrets(&self, id: Uuid, secrets: &[SealedSecret]) -> StorageResult<Model>;

    async fn load_paged(&self, project_id: Uuid, page: PageRequest) -> StorageResult<Page<Model>>;
}

#[derive(Debug, Clone)]
pub struct SeaEndpointRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaEndpointRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn require(&self, id: Uuid) -> StorageResult<Model> {
        self.find_by_id(id)
            .await?
            .ok_or(StorageError::NotFound {
                entity: "endpoint",
                id,
            })
    }
}

#[async_trait]
impl EndpointRepository for SeaEndpointRepository {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>> {
        Endpoint::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find endpoint", e))
    }

    async fn create(&self, endpoint: Model) -> StorageResult<Model> {
        endpoint
            .into_active_model()
            .reset_all()
            .insert(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("create endpoint", e))
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: EndpointHealth,
        next: EndpointHealth,
    ) -> StorageResult<bool> {
        let result = Endpoint::update_many()
            .col_expr(Column::Status, Expr::value(next.status.as_str()))
            .col_expr(Column::FailureCount, Expr::value(next.failure_count as i32))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(expected.status.as_str()))
            .filter(Column::FailureCount.eq(expected.failure_count as i32))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("update endpoint status", e))?;

        Ok(result.rows_affected > 0)
    }

    async fn set_disabled(&self, id: Uuid, disabled: bool) -> StorageResult<Model> {
        let endpoint = self.require(id).await?;

        let mut active: ActiveModel = endpoint.into();
        active.disabled = Set(disabled);
        if !disabled {
            active.status = Set(EndpointHealth::healthy().status.as_str().to_string());
            active.failure_count = Set(0);
        }
        active.updated_at = Set(to_db_time(Utc::now()));

        active
            .update(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("update endpoint disabled flag", e))
    }

    async fn update_secrets(&self, id: Uuid, secrets: &[SealedSecret]) -> StorageResult<Model> {
        let endpoint = self.require(id).await?;

        let mut active: ActiveModel = endpoint.into();
        active.secrets = Set(serde_json::to_value(secrets)?);
        active.updated_at = Set(to_db_time(Utc::now()));

        active
            .update(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("update endpoint secrets", e))
    }

    async fn load_paged(&self, project_id: Uuid, page: PageRequest) -> StorageResult<Page<Model>> {
        let limit = page.effective_limit();
        let mut query = Endpoint::find()
            .filter(Column::ProjectId.eq(project_id))
            .order_by_asc(Column::Id)
            .limit(limit);

        if let Some(after) = page.after {
            query = query.filter(Column::Id.gt(after));
        }

        let rows = query
            .all(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("list endpoints", e))?;

        Ok(Page::from_rows(rows, limit, |row| row.id))
    }
}
