//! # Source Repository

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel};
use uuid::Uuid;

use super::{StorageResult, map_db_err};
use crate::models::source::{Entity as Source, Model};

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>>;
    async fn create(&self, source: Model) -> StorageResult<Model>;
}

#[derive(Debug, Clone)]
pub struct SeaSourceRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaSourceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SourceRepository for SeaSourceRepository {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>> {
        Source::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find source", e))
    }

    async fn create(&self, source: Model) -> StorageResult<Model> {
        source
            .into_active_model()
            .reset_all()
            .insert(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("create source", e))
    }
}
