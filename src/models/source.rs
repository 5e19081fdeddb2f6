//! Source entity model
//!
//! A source describes an inbound ingestion channel and how its requests are
//! authenticated before events are admitted.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::webhook_verification::VerifierConfig;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sources")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    pub name: String,

    /// Serialized [`VerifierConfig`]
    #[sea_orm(column_type = "JsonBinary")]
    pub verifier: JsonValue,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn verifier_config(&self) -> Result<VerifierConfig, serde_json::Error> {
        serde_json::from_value(self.verifier.clone())
    }
}
