//! Database migrations for the courier delivery engine.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_000001_create_projects;
mod m2026_01_05_000002_create_sources;
mod m2026_01_05_000003_create_endpoints;
mod m2026_01_05_000004_create_subscriptions;
mod m2026_01_05_000005_create_events;
mod m2026_01_05_000006_create_event_deliveries;
mod m2026_01_05_000007_create_delivery_attempts;
mod m2026_01_05_000008_create_delivery_queue;
mod m2026_01_05_000009_create_rate_limit_counters;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_000001_create_projects::Migration),
            Box::new(m2026_01_05_000002_create_sources::Migration),
            Box::new(m2026_01_05_000003_create_endpoints::Migration),
            Box::new(m2026_01_05_000004_create_subscriptions::Migration),
            Box::new(m2026_01_05_000005_create_events::Migration),
            Box::new(m2026_01_05_000006_create_event_deliveries::Migration),
            Box::new(m2026_01_05_000007_create_delivery_attempts::Migration),
            Box::new(m2026_01_05_000008_create_delivery_queue::Migration),
            Box::new(m2026_01_05_000009_create_rate_limit_counters::Migration),
        ]
    }
}
