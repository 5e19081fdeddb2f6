//! # Project Repository

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel};
use uuid::Uuid;

use super::{StorageResult, map_db_err};
use crate::models::project::{Entity as Project, Model};

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>>;
    async fn create(&self, project: Model) -> StorageResult<Model>;
}

#[derive(Debug, Clone)]
pub struct SeaProjectRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaProjectRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProjectRepository for SeaProjectRepository {
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<Model>> {
        Project::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("find project", e))
    }

    async fn create(&self, project: Model) -> StorageResult<Model> {
        project
            .into_active_model()
            .reset_all()
            .insert(self.db.as_ref())
            .await
            .map_err(|e| map_db_err("create project", e))
    }
}
