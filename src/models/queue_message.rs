//! Delivery queue message entity
//!
//! Rows move through `delayed` (scheduling set), `ready` (active stream)
//! and `pending` (leased to a consumer). Acknowledged rows are deleted.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "delivery_queue")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub delivery_id: Uuid,

    pub project_id: Uuid,

    pub manual: bool,

    pub state: String,

    /// Score in the scheduling set (unix millis)
    pub ready_at_ms: i64,

    /// Stream position once promoted
    pub promoted_at_ms: Option<i64>,

    pub consumer: Option<String>,

    pub lease_token: Option<Uuid>,

    pub lease_expires_at_ms: Option<i64>,

    /// Times this message has been leased
    pub delivery_count: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
