//! Endpoint entity model
//!
//! This module contains the SeaORM entity model for the endpoints table.
//! Secrets, the signature scheme and custom headers are stored as JSON
//! columns and decoded through the accessor methods below.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::rate_limiter::RateLimit;
use crate::signature::{SealedSecret, SignatureScheme};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "endpoints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning project
    pub project_id: Uuid,

    pub name: String,

    /// Delivery target URL
    pub url: String,

    /// Serialized list of [`SealedSecret`] entries
    #[sea_orm(column_type = "JsonBinary")]
    pub secrets: JsonValue,

    /// Serialized [`SignatureScheme`]
    #[sea_orm(column_type = "JsonBinary")]
    pub signature: JsonValue,

    /// Extra request headers sent with every delivery
    #[sea_orm(column_type = "JsonBinary")]
    pub headers: Option<JsonValue>,

    /// Per-endpoint HTTP timeout, bounded by the dispatcher maximum
    pub http_timeout_seconds: i32,

    /// Health status (active|pending|inactive)
    pub status: String,

    /// Explicit tenant disable, orthogonal to health
    pub disabled: bool,

    /// Consecutive failed deliveries since the last success
    pub failure_count: i32,

    pub rate_limit_count: i32,

    pub rate_limit_duration: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Health of an endpoint as driven by delivery outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Active,
    Pending,
    Inactive,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Active => "active",
            EndpointStatus::Pending => "pending",
            EndpointStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(EndpointStatus::Active),
            "pending" => Ok(EndpointStatus::Pending),
            "inactive" => Ok(EndpointStatus::Inactive),
            other => Err(format!("unknown endpoint status '{other}'")),
        }
    }
}

impl Model {
    /// Parsed health status; unknown values are treated as inactive so a
    /// corrupt row never receives traffic.
    pub fn health(&self) -> EndpointStatus {
        self.status.parse().unwrap_or(EndpointStatus::Inactive)
    }

    pub fn sealed_secrets(&self) -> Result<Vec<SealedSecret>, serde_json::Error> {
        serde_json::from_value(self.secrets.clone())
    }

    pub fn signature_scheme(&self) -> Result<SignatureScheme, serde_json::Error> {
        serde_json::from_value(self.signature.clone())
    }

    pub fn custom_headers(&self) -> BTreeMap<String, String> {
        self.headers
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            count: self.rate_limit_count.max(0) as u32,
            duration: self.rate_limit_duration.clone(),
        }
    }
}
