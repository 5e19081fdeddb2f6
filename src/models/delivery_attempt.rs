//! DeliveryAttempt entity model
//!
//! Append-only record of one HTTP try for a delivery.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "delivery_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub delivery_id: Uuid,

    /// 1-based, strictly increasing per delivery
    pub attempt_number: i32,

    /// Triggered by a manual or forced resend
    pub manual: bool,

    pub url: String,

    pub method: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub request_headers: JsonValue,

    /// Signature versions sent, e.g. `v1,v2`
    pub signature_version: Option<String>,

    pub response_status: Option<i32>,

    #[sea_orm(column_type = "JsonBinary")]
    pub response_headers: Option<JsonValue>,

    /// Response body, truncated to the configured cap
    pub response_body: Option<String>,

    /// Transport or classification error
    pub error: Option<String>,

    pub duration_ms: i64,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
