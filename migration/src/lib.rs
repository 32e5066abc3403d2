//! Database migrations for the collections sync service.

pub use sea_orm_migration::prelude::*;

mod m2026_09_01_000001_create_qb_connections;
mod m2026_09_01_000002_create_oauth_states;
mod m2026_09_01_000003_create_customers;
mod m2026_09_01_000004_create_invoices;
mod m2026_09_01_000005_create_sync_cursors;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_09_01_000001_create_qb_connections::Migration),
            Box::new(m2026_09_01_000002_create_oauth_states::Migration),
            Box::new(m2026_09_01_000003_create_customers::Migration),
            Box::new(m2026_09_01_000004_create_invoices::Migration),
            Box::new(m2026_09_01_000005_create_sync_cursors::Migration),
        ]
    }
}
