//! # Repository Layer
//!
//! One async storage port per entity, each with a SeaORM implementation.
//! Engine components depend on the traits, never on the database handle, so
//! tests can swap in alternative stores.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{DatabaseConnection, DbErr, RuntimeErr};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub mod endpoint;
pub mod event;
pub mod event_delivery;
pub mod project;
pub mod source;
pub mod subscription;

pub use endpoint::{EndpointRepository, SeaEndpointRepository};
pub use event::{EventRepository, SeaEventRepository};
pub use event_delivery::{
    DeliveryFilter, DeliveryUpdate, EventDeliveryRepository, NewDeliveryAttempt,
    SeaEventDeliveryRepository,
};
pub use project::{ProjectRepository, SeaProjectRepository};
pub use source::{SeaSourceRepository, SourceRepository};
pub use subscription::{SeaSubscriptionRepository, SubscriptionRepository};

/// Default and maximum page sizes for `load_paged`.
pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const MAX_PAGE_SIZE: u64 = 1_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("stored value could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Keyset page request. Rows are ordered by id; `after` is the last id of
/// the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u64,
    pub after: Option<Uuid>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            after: None,
        }
    }
}

impl PageRequest {
    pub fn first(limit: u64) -> Self {
        Self { limit, after: None }
    }

    pub fn effective_limit(&self) -> u64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` once the listing is exhausted.
    pub next_cursor: Option<Uuid>,
}

impl<T> Page<T> {
    pub(crate) fn from_rows(items: Vec<T>, limit: u64, id_of: impl Fn(&T) -> Uuid) -> Self {
        let next_cursor = if items.len() as u64 >= limit {
            items.last().map(id_of)
        } else {
            None
        };
        Self { items, next_cursor }
    }
}

/// The full set of storage ports, shared by the engine components.
#[derive(Clone)]
pub struct Repositories {
    pub projects: Arc<dyn ProjectRepository>,
    pub sources: Arc<dyn SourceRepository>,
    pub endpoints: Arc<dyn EndpointRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub events: Arc<dyn EventRepository>,
    pub deliveries: Arc<dyn EventDeliveryRepository>,
}

impl Repositories {
    /// SeaORM-backed repositories sharing one connection pool.
    pub fn sea_orm(db: Arc<DatabaseConnection>) -> Self {
        Self {
            projects: Arc::new(SeaProjectRepository::new(db.clone())),
            sources: Arc::new(SeaSourceRepository::new(db.clone())),
            endpoints: Arc::new(SeaEndpointRepository::new(db.clone())),
            subscriptions: Arc::new(SeaSubscriptionRepository::new(db.clone())),
            events: Arc::new(SeaEventRepository::new(db.clone())),
            deliveries: Arc::new(SeaEventDeliveryRepository::new(db)),
        }
    }
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err)))
        | DbErr::Query(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err))) => {
            matches!(db_err.code().as_deref(), Some("23505") | Some("2067") | Some("1555"))
        }
        _ => false,
    }
}

pub(crate) fn map_db_err(context: &'static str, err: DbErr) -> StorageError {
    if is_unique_violation(&err) {
        return StorageError::Conflict(format!("{context}: duplicate key"));
    }
    error!(error = ?err, context, "Database operation failed");
    StorageError::Database(err)
}

pub(crate) fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    dt.fixed_offset()
}
