//! Migration to create the event_deliveries table.
//!
//! One row per (event, endpoint) pair. The retry configuration is
//! snapshotted at creation so later subscription edits do not change the
//! budget of in-flight deliveries.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EventDeliveries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EventDeliveries::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EventDeliveries::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(EventDeliveries::EventId).uuid().not_null())
                    .col(ColumnDef::new(EventDeliveries::EndpointId).uuid().not_null())
                    .col(
                        ColumnDef::new(EventDeliveries::SubscriptionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EventDeliveries::SourceId).uuid().null())
                    .col(
                        ColumnDef::new(EventDeliveries::Status)
                            .text()
                            .not_null()
                            .default("scheduled"),
                    )
                    .col(
                        ColumnDef::new(EventDeliveries::RetryConfig)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EventDeliveries::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EventDeliveries::AutoAttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EventDeliveries::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EventDeliveries::Description).text().null())
                    .col(ColumnDef::new(EventDeliveries::ClaimedBy).uuid().null())
                    .col(
                        ColumnDef::new(EventDeliveries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(EventDeliveries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_event_deliveries_event_id")
                            .from(EventDeliveries::Table, EventDeliveries::EventId)
                            .to(Events::Table, Events::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_event_deliveries_project_status")
                    .table(EventDeliveries::Table)
                    .col(EventDeliveries::ProjectId)
                    .col(EventDeliveries::Status)
                    .col(EventDeliveries::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_event_deliveries_endpoint_status")
                    .table(EventDeliveries::Table)
                    .col(EventDeliveries::EndpointId)
                    .col(EventDeliveries::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_event_deliveries_status_next_attempt")
                    .table(EventDeliveries::Table)
                    .col(EventDeliveries::Status)
                    .col(EventDeliveries::NextAttemptAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_event_deliveries_project_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_event_deliveries_endpoint_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_event_deliveries_status_next_attempt")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(EventDeliveries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EventDeliveries {
    Table,
    Id,
    ProjectId,
    EventId,
    EndpointId,
    SubscriptionId,
    SourceId,
    Status,
    RetryConfig,
    AttemptCount,
    AutoAttemptCount,
    NextAttemptAt,
    Description,
    ClaimedBy,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Events {
    Table,
    Id,
}
