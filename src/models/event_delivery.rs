//! EventDelivery entity model
//!
//! One row per (event, endpoint) pair; the unit of delivery work and of
//! observability.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::retry::RetryConfig;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "event_deliveries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    pub event_id: Uuid,

    pub endpoint_id: Uuid,

    pub subscription_id: Uuid,

    pub source_id: Option<Uuid>,

    /// Lifecycle status (see [`DeliveryStatus`])
    pub status: String,

    /// Retry configuration snapshotted from the subscription
    #[sea_orm(column_type = "JsonBinary")]
    pub retry_config: JsonValue,

    /// Every attempt, manual or automatic
    pub attempt_count: i32,

    /// Attempts that count against the retry budget
    pub auto_attempt_count: i32,

    pub next_attempt_at: DateTimeWithTimeZone,

    /// Last error or the reason for the current status
    pub description: Option<String>,

    /// Queue job holding the `processing` claim
    pub claimed_by: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle status of an event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Scheduled,
    Processing,
    Success,
    Failure,
    Retry,
    Discarded,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 6] = [
        DeliveryStatus::Scheduled,
        DeliveryStatus::Processing,
        DeliveryStatus::Success,
        DeliveryStatus::Failure,
        DeliveryStatus::Retry,
        DeliveryStatus::Discarded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failure => "failure",
            DeliveryStatus::Retry => "retry",
            DeliveryStatus::Discarded => "discarded",
        }
    }

    /// No automatic work remains. `Failure` only leaves this set through a
    /// manual resend.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Success | DeliveryStatus::Failure | DeliveryStatus::Discarded
        )
    }

    /// States a queue job may claim for dispatch. `Processing` is only
    /// re-claimable by the job that already holds it.
    pub fn claimable() -> &'static [DeliveryStatus] {
        &[DeliveryStatus::Scheduled, DeliveryStatus::Retry]
    }

    /// Non-terminal states the worker may settle from.
    pub fn dispatchable() -> &'static [DeliveryStatus] {
        &[
            DeliveryStatus::Scheduled,
            DeliveryStatus::Retry,
            DeliveryStatus::Processing,
        ]
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown delivery status '{value}'"))
    }
}

impl Model {
    pub fn delivery_status(&self) -> Result<DeliveryStatus, String> {
        self.status.parse()
    }

    pub fn retry(&self) -> Result<RetryConfig, serde_json::Error> {
        serde_json::from_value(self.retry_config.clone())
    }
}
