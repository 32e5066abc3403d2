//! Migration to create the invoices table.
//!
//! Invoices mirror QuickBooks records; `(connection_id, external_id)` is unique so
//! a re-sync overwrites instead of duplicating.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Invoices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Invoices::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Invoices::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(Invoices::ExternalId).text().not_null())
                    .col(ColumnDef::new(Invoices::DocNumber).text().null())
                    .col(ColumnDef::new(Invoices::CustomerId).uuid().not_null())
                    .col(ColumnDef::new(Invoices::CustomerRef).text().not_null())
                    .col(ColumnDef::new(Invoices::AmountMinor).big_integer().not_null())
                    .col(
                        ColumnDef::new(Invoices::OpenBalanceMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Invoices::Currency).text().null())
                    .col(ColumnDef::new(Invoices::Status).text().not_null())
                    .col(ColumnDef::new(Invoices::InvoiceDate).date().null())
                    .col(ColumnDef::new(Invoices::DueDate).date().null())
                    .col(
                        ColumnDef::new(Invoices::SourceLastModified)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Invoices::SyncedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Invoices::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Invoices::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_invoices_connection_id")
                            .from(Invoices::Table, Invoices::ConnectionId)
                            .to(QbConnections::Table, QbConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_invoices_customer_id")
                            .from(Invoices::Table, Invoices::CustomerId)
                            .to(Customers::Table, Customers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_invoices_connection_external_id")
                    .table(Invoices::Table)
                    .col(Invoices::ConnectionId)
                    .col(Invoices::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_invoices_connection_invoice_date")
                    .table(Invoices::Table)
                    .col(Invoices::ConnectionId)
                    .col(Invoices::InvoiceDate)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Invoices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Invoices {
    Table,
    Id,
    ConnectionId,
    ExternalId,
    DocNumber,
    CustomerId,
    CustomerRef,
    AmountMinor,
    OpenBalanceMinor,
    Currency,
    Status,
    InvoiceDate,
    DueDate,
    SourceLastModified,
    SyncedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum QbConnections {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Customers {
    Table,
    Id,
}
