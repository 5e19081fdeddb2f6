//! Migration to create the endpoints table.
//!
//! Endpoints hold the delivery URL, sealed signing secrets, the signature
//! scheme, health status and the dispatch rate limit.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Endpoints::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Endpoints::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Endpoints::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Endpoints::Name).text().not_null())
                    .col(ColumnDef::new(Endpoints::Url).text().not_null())
                    .col(ColumnDef::new(Endpoints::Secrets).json_binary().not_null())
                    .col(ColumnDef::new(Endpoints::Signature).json_binary().not_null())
                    .col(ColumnDef::new(Endpoints::Headers).json_binary().null())
                    .col(
                        ColumnDef::new(Endpoints::HttpTimeoutSeconds)
                            .integer()
                            .not_null()
                            .default(30),
                    )
                    .col(
                        ColumnDef::new(Endpoints::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Endpoints::Disabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Endpoints::FailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Endpoints::RateLimitCount)
                            .integer()
                            .not_null()
                            .default(5000),
                    )
                    .col(
                        ColumnDef::new(Endpoints::RateLimitDuration)
                            .text()
                            .not_null()
                            .default("1m"),
                    )
                    .col(
                        ColumnDef::new(Endpoints::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Endpoints::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_endpoints_project_id")
                            .from(Endpoints::Table, Endpoints::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_endpoints_project_status")
                    .table(Endpoints::Table)
                    .col(Endpoints::ProjectId)
                    .col(Endpoints::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_endpoints_project_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Endpoints::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Endpoints {
    Table,
    Id,
    ProjectId,
    Name,
    Url,
    Secrets,
    Signature,
    Headers,
    HttpTimeoutSeconds,
    Status,
    Disabled,
    FailureCount,
    RateLimitCount,
    RateLimitDuration,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Projects {
    Table,
    Id,
}
