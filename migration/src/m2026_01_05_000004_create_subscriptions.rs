//! Migration to create the subscriptions table.
//!
//! Subscriptions bind a project (and optionally an inbound source) to an
//! endpoint with filter, retry, alert and rate-limit settings.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Subscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Subscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Subscriptions::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Subscriptions::SourceId).uuid().null())
                    .col(ColumnDef::new(Subscriptions::EndpointId).uuid().not_null())
                    .col(ColumnDef::new(Subscriptions::Name).text().not_null())
                    .col(
                        ColumnDef::new(Subscriptions::FilterConfig)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::RetryConfig)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Subscriptions::AlertConfig).json_binary().null())
                    .col(
                        ColumnDef::new(Subscriptions::RateLimitConfig)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_subscriptions_endpoint_id")
                            .from(Subscriptions::Table, Subscriptions::EndpointId)
                            .to(Endpoints::Table, Endpoints::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_subscriptions_project_source_enabled")
                    .table(Subscriptions::Table)
                    .col(Subscriptions::ProjectId)
                    .col(Subscriptions::SourceId)
                    .col(Subscriptions::Enabled)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_subscriptions_project_source_enabled")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Subscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Subscriptions {
    Table,
    Id,
    ProjectId,
    SourceId,
    EndpointId,
    Name,
    FilterConfig,
    RetryConfig,
    AlertConfig,
    RateLimitConfig,
    Enabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Endpoints {
    Table,
    Id,
}
