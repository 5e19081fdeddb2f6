//! Subscription entity model
//!
//! Subscriptions bind events of a project (or of one inbound source) to an
//! endpoint. Filter, retry, alert and rate-limit settings live in JSON
//! columns.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::matcher::FilterConfig;
use crate::rate_limiter::RateLimit;
use crate::retry::RetryConfig;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "subscriptions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    /// Inbound source; `None` for outbound subscriptions
    pub source_id: Option<Uuid>,

    pub endpoint_id: Uuid,

    pub name: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub filter_config: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub retry_config: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub alert_config: Option<JsonValue>,

    /// Overrides the endpoint rate limit when present
    #[sea_orm(column_type = "JsonBinary")]
    pub rate_limit_config: Option<JsonValue>,

    pub enabled: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Failure count at which the owning tenant is notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub count: u32,
}

impl Model {
    pub fn filter(&self) -> Result<FilterConfig, serde_json::Error> {
        serde_json::from_value(self.filter_config.clone())
    }

    pub fn retry(&self) -> Result<RetryConfig, serde_json::Error> {
        serde_json::from_value(self.retry_config.clone())
    }

    pub fn alert(&self) -> Option<AlertConfig> {
        self.alert_config
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn rate_limit_override(&self) -> Option<RateLimit> {
        self.rate_limit_config
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}
