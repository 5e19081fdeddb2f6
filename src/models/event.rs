//! Event entity model
//!
//! Events are written once at ingestion and never updated.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    pub source_id: Option<Uuid>,

    pub event_type: String,

    pub idempotency_key: Option<String>,

    /// Raw request body, delivered byte for byte
    pub payload: Vec<u8>,

    /// Forwarded request headers as a flat JSON object
    #[sea_orm(column_type = "JsonBinary")]
    pub headers: Option<JsonValue>,

    /// Set when an earlier event in the project carried the same idempotency key
    pub is_duplicate: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Payload parsed as JSON, or `Null` when the body is not valid JSON.
    pub fn payload_json(&self) -> JsonValue {
        serde_json::from_slice(&self.payload).unwrap_or(JsonValue::Null)
    }
}
