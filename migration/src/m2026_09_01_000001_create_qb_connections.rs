//! Migration to create the qb_connections table.
//!
//! One row per user holding the QuickBooks realm and the encrypted OAuth tokens.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QbConnections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QbConnections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QbConnections::UserId).text().not_null())
                    .col(ColumnDef::new(QbConnections::RealmId).text().not_null())
                    .col(
                        ColumnDef::new(QbConnections::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(QbConnections::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QbConnections::RefreshTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QbConnections::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QbConnections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QbConnections::UpdatedAt)
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
                    .name("idx_qb_connections_user_id")
                    .table(QbConnections::Table)
                    .col(QbConnections::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_qb_connections_user_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(QbConnections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QbConnections {
    Table,
    Id,
    UserId,
    RealmId,
    Status,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}
