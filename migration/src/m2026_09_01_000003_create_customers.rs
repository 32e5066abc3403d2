//! Migration to create the customers table.
//!
//! Customers are mirrored from QuickBooks `CustomerRef` values while invoices sync.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Customers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Customers::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Customers::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(Customers::ExternalRef).text().not_null())
                    .col(ColumnDef::new(Customers::Name).text().not_null())
                    .col(
                        ColumnDef::new(Customers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Customers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_customers_connection_id")
                            .from(Customers::Table, Customers::ConnectionId)
                            .to(QbConnections::Table, QbConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_customers_connection_external_ref")
                    .table(Customers::Table)
                    .col(Customers::ConnectionId)
                    .col(Customers::ExternalRef)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Customers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Customers {
    Table,
    Id,
    ConnectionId,
    ExternalRef,
    Name,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum QbConnections {
    Table,
    Id,
}
