//! Migration to create the events table.
//!
//! Events are immutable. The raw payload is stored as bytes so the exact
//! body can be signed and delivered verbatim. A partial unique index keeps
//! concurrent requests with one idempotency key from both fanning out.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Events::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Events::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Events::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Events::SourceId).uuid().null())
                    .col(ColumnDef::new(Events::EventType).text().not_null())
                    .col(ColumnDef::new(Events::IdempotencyKey).text().null())
                    .col(ColumnDef::new(Events::Payload).binary().not_null())
                    .col(ColumnDef::new(Events::Headers).json_binary().null())
                    .col(
                        ColumnDef::new(Events::IsDuplicate)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Events::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_events_project_idempotency_key")
                    .table(Events::Table)
                    .col(Events::ProjectId)
                    .col(Events::IdempotencyKey)
                    .to_owned(),
            )
            .await?;

        // At most one original per idempotency key; duplicates are
        // recorded alongside it.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_events_project_idempotency_original \
                 ON events (project_id, idempotency_key) \
                 WHERE is_duplicate = false AND idempotency_key IS NOT NULL",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("uq_events_project_idempotency_original")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_events_project_idempotency_key")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Events::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Events {
    Table,
    Id,
    ProjectId,
    SourceId,
    EventType,
    IdempotencyKey,
    Payload,
    Headers,
    IsDuplicate,
    CreatedAt,
}
