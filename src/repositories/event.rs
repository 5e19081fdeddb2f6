//! # Event Repository
//!
//! Events are insert-only.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use uuid::Uuid;

use super::{Page, PageRequest, StorageResult, map_db_err};
use crate::models::event::{Column, Entity as Event, Model};

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>>;

    async fn create(&self, event: Model) -> StorageResult<Model>;

    /// Whether a non-duplicate event with this idempotency key exists in
    /// the project.
    async fn exists_with_idempotency_key(&self, project_id: Uuid, key: &str)
    -> StorageResult<bool>;

    async fn load_paged(&self, project_id: Uuid, page: PageRequest) -> StorageResult<Page<Model>>;
}

#[derive(Debug, Clone)]
pub struct SeaEventRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaEventRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventRepository for SeaEventRepository {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>> {
        Event::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find event", e))
    }

    async fn create(&self, event: Model) -> StorageResult<Model> {
        event
            .into_active_model()
            .reset_all()
            .insert(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("create event", e))
    }

    async fn exists_with_idempotency_key(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> StorageResult<bool> {
        let count = Event::find()
            .filter(Column::ProjectId.eq(project_id))
            .filter(Column::IdempotencyKey.eq(key))
            .filter(Column::IsDuplicate.eq(false))
            .count(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("count events by idempotency key", e))?;

        Ok(count > 0)
    }

    async fn load_paged(&self, project_id: Uuid, page: PageRequest) -> StorageResult<Page<Model>> {
        let limit = page.effective_limit();
        let mut query = Event::find()
            .filter(Column::ProjectId.eq(project_id))
            .order_by_asc(Column::Id)
            .limit(limit);

        if let Some(after) = page.after {
            query = query.filter(Column::Id.gt(after));
        }

        let rows = query
            .all(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("list events", e))?;

        Ok(Page::from_rows(rows, limit, |row| row.id))
    }
}
