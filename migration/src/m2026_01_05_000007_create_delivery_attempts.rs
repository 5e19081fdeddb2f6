//! Migration to create the delivery_attempts table.
//!
//! Append-only history of HTTP tries. The unique (delivery_id,
//! attempt_number) index keeps attempts strictly ordered per delivery.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeliveryAttempts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeliveryAttempts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeliveryAttempts::DeliveryId).uuid().not_null())
                    .col(
                        ColumnDef::new(DeliveryAttempts::AttemptNumber)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeliveryAttempts::Manual)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(DeliveryAttempts::Url).text().not_null())
                    .col(ColumnDef::new(DeliveryAttempts::Method).text().not_null())
                    .col(
                        ColumnDef::new(DeliveryAttempts::RequestHeaders)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeliveryAttempts::SignatureVersion).text().null())
                    .col(ColumnDef::new(DeliveryAttempts::ResponseStatus).integer().null())
                    .col(
                        ColumnDef::new(DeliveryAttempts::ResponseHeaders)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(DeliveryAttempts::ResponseBody).text().null())
                    .col(ColumnDef::new(DeliveryAttempts::Error).text().null())
                    .col(
                        ColumnDef::new(DeliveryAttempts::DurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DeliveryAttempts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_delivery_attempts_delivery_id")
                            .from(DeliveryAttempts::Table, DeliveryAttempts::DeliveryId)
                            .to(EventDeliveries::Table, EventDeliveries::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_delivery_attempts_delivery_number")
                    .table(DeliveryAttempts::Table)
                    .col(DeliveryAttempts::DeliveryId)
                    .col(DeliveryAttempts::AttemptNumber)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_delivery_attempts_delivery_number")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DeliveryAttempts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeliveryAttempts {
    Table,
    Id,
    DeliveryId,
    AttemptNumber,
    Manual,
    Url,
    Method,
    RequestHeaders,
    SignatureVersion,
    ResponseStatus,
    ResponseHeaders,
    ResponseBody,
    Error,
    DurationMs,
    CreatedAt,
}

#[derive(DeriveIden)]
enum EventDeliveries {
    Table,
    Id,
}
