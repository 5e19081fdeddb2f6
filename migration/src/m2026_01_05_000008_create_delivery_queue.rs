//! Migration to create the delivery_queue table.
//!
//! A single table backs both the scheduling set (`delayed` rows ordered by
//! `ready_at_ms`) and the active stream (`ready` rows ordered by
//! `promoted_at_ms`, `pending` rows owned by a consumer until acked or the
//! lease expires).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeliveryQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeliveryQueue::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeliveryQueue::DeliveryId).uuid().not_null())
                    .col(ColumnDef::new(DeliveryQueue::ProjectId).uuid().not_null())
                    .col(
                        ColumnDef::new(DeliveryQueue::Manual)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(DeliveryQueue::State)
                            .text()
                            .not_null()
                            .default("delayed"),
                    )
                    .col(
                        ColumnDef::new(DeliveryQueue::ReadyAtMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeliveryQueue::PromotedAtMs).big_integer().null())
                    .col(ColumnDef::new(DeliveryQueue::Consumer).text().null())
                    .col(ColumnDef::new(DeliveryQueue::LeaseToken).uuid().null())
                    .col(
                        ColumnDef::new(DeliveryQueue::LeaseExpiresAtMs)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DeliveryQueue::DeliveryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DeliveryQueue::CreatedAt)
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
                    .name("idx_delivery_queue_state_ready_at")
                    .table(DeliveryQueue::Table)
                    .col(DeliveryQueue::State)
                    .col(DeliveryQueue::ReadyAtMs)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_delivery_queue_state_lease_expiry")
                    .table(DeliveryQueue::Table)
                    .col(DeliveryQueue::State)
                    .col(DeliveryQueue::LeaseExpiresAtMs)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_delivery_queue_delivery_id")
                    .table(DeliveryQueue::Table)
                    .col(DeliveryQueue::DeliveryId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_delivery_queue_delivery_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_delivery_queue_state_ready_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_delivery_queue_state_lease_expiry")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DeliveryQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeliveryQueue {
    Table,
    Id,
    DeliveryId,
    ProjectId,
    Manual,
    State,
    ReadyAtMs,
    PromotedAtMs,
    Consumer,
    LeaseToken,
    LeaseExpiresAtMs,
    DeliveryCount,
    CreatedAt,
}
