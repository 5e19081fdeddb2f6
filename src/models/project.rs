//! Project entity model
//!
//! Projects are the tenant boundary for endpoints, subscriptions and events.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

use crate::rate_limiter::RateLimit;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "projects")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    /// Events admitted per `rate_limit_duration` at ingestion
    pub rate_limit_count: i32,

    /// Window length as a duration string such as `1m`
    pub rate_limit_duration: String,

    /// Whether repeated failures may deactivate endpoints in this project
    pub disable_endpoint: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Ingestion rate limit for this project.
    pub fn ingest_rate_limit(&self) -> RateLimit {
        RateLimit {
            count: self.rate_limit_count.max(0) as u32,
            duration: self.rate_limit_duration.clone(),
        }
    }
}
