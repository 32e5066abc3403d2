//! Invoice repository
//!
//! Upserts keyed by `(connection_id, external_id)`. A stored row is only
//! overwritten by a strictly newer source version.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::NullOrdering;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, Order, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::connectors::InvoiceRecord;
use crate::models::invoice::{self, Entity as Invoice};

/// Upper bound on rows returned by listing queries
pub const MAX_LIST_LIMIT: u64 = 1000;

/// What an upsert did with the incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Same or older than the stored version; nothing written
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct InvoiceRepository {
    db: Arc<DatabaseConnection>,
}

impl InvoiceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn upsert<C: ConnectionTrait>(
        conn: &C,
        connection_id: Uuid,
        customer_id: Uuid,
        record: &InvoiceRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let existing = Invoice::find()
            .filter(invoice::Column::ConnectionId.eq(connection_id))
            .filter(invoice::Column::ExternalId.eq(record.external_id.as_str()))
            .one(conn)
            .await?;

        match existing {
            Some(stored) if record.last_modified <= stored.source_last_modified => {
                Ok(UpsertOutcome::Unchanged)
            }
            Some(stored) => {
                let mut active: invoice::ActiveModel = stored.into();
                apply_record(&mut active, customer_id, record);
                active.synced_at = Set(now);
                active.updated_at = Set(now);
                active.update(conn).await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let mut active = invoice::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    connection_id: Set(connection_id),
                    external_id: Set(record.external_id.clone()),
                    synced_at: Set(now),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                apply_record(&mut active, customer_id, record);
                Invoice::insert(active).exec_without_returning(conn).await?;
                Ok(UpsertOutcome::Created)
            }
        }
    }

    /// Mirrored invoices of a connection, newest invoice date first
    pub async fn list_for_connection(
        &self,
        connection_id: Uuid,
        limit: u64,
    ) -> Result<Vec<invoice::Model>> {
        Ok(Invoice::find()
            .filter(invoice::Column::ConnectionId.eq(connection_id))
            .order_by_with_nulls(invoice::Column::InvoiceDate, Order::Desc, NullOrdering::Last)
            .order_by_desc(invoice::Column::SourceLastModified)
            .limit(limit.min(MAX_LIST_LIMIT))
            .all(&*self.db)
            .await?)
    }

    pub async fn find_by_external_id(
        &self,
        connection_id: Uuid,
        external_id: &str,
    ) -> Result<Option<invoice::Model>> {
        Ok(Invoice::find()
            .filter(invoice::Column::ConnectionId.eq(connection_id))
            .filter(invoice::Column::ExternalId.eq(external_id))
            .one(&*self.db)
            .await?)
    }
}

fn apply_record(active: &mut invoice::ActiveModel, customer_id: Uuid, record: &InvoiceRecord) {
    active.doc_number = Set(record.doc_number.clone());
    active.customer_id = Set(customer_id);
    active.customer_ref = Set(record.customer_ref.clone());
    active.amount_minor = Set(record.amount_minor);
    active.open_balance_minor = Set(record.open_balance_minor);
    active.currency = Set(record.currency.clone());
    active.status = Set(record.status.clone());
    active.invoice_date = Set(record.invoice_date);
    active.due_date = Set(record.due_date);
    active.source_last_modified = Set(record.last_modified);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoKey;
    use crate::repositories::{ConnectionRepository, CustomerRepository, SyncCursorRepository};
    use chrono::{NaiveDate, TimeZone};
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, TransactionTrait};

    async fn setup() -> (Arc<DatabaseConnection>, Uuid) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let db = Arc::new(db);
        let connections =
            ConnectionRepository::new(db.clone(), CryptoKey::new(vec![1u8; 32]).unwrap());
        let conn = connections
            .upsert_for_user("user-1", "realm-1", "a", "r", Utc::now())
            .await
            .unwrap();
        (db, conn.id)
    }

    fn record(id: &str, hour: u32, balance: i64) -> InvoiceRecord {
        InvoiceRecord {
            external_id: id.to_string(),
            doc_number: Some(format!("D-{}", id)),
            customer_ref: "42".to_string(),
            customer_name: "Acme".to_string(),
            amount_minor: 10_000,
            open_balance_minor: balance,
            currency: Some("USD".to_string()),
            status: if balance > 0 { "OPEN" } else { "PAID" }.to_string(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            due_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            last_modified: Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap(),
        }
    }

    async fn upsert(db: &DatabaseConnection, connection_id: Uuid, rec: &InvoiceRecord) -> UpsertOutcome {
        let txn = db.begin().await.unwrap();
        let customer_id =
            CustomerRepository::get_or_create(&txn, connection_id, &rec.customer_ref, &rec.customer_name, Utc::now())
                .await
                .unwrap();
        let outcome = InvoiceRepository::upsert(&txn, connection_id, customer_id, rec, Utc::now())
            .await
            .unwrap();
        txn.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_upsert_only_moves_forward() {
        let (db, connection_id) = setup().await;
        let repo = InvoiceRepository::new(db.clone());

        assert_eq!(upsert(&db, connection_id, &record("1", 10, 500)).await, UpsertOutcome::Created);
        assert_eq!(upsert(&db, connection_id, &record("1", 10, 500)).await, UpsertOutcome::Unchanged);
        assert_eq!(upsert(&db, connection_id, &record("1", 9, 700)).await, UpsertOutcome::Unchanged);
        assert_eq!(upsert(&db, connection_id, &record("1", 11, 0)).await, UpsertOutcome::Updated);

        let stored = repo.find_by_external_id(connection_id, "1").await.unwrap().unwrap();
        assert_eq!(stored.open_balance_minor, 0);
        assert_eq!(stored.status, "PAID");
        assert_eq!(
            stored.source_last_modified,
            Utc.with_ymd_and_hms(2024, 1, 2, 11, 0, 0).unwrap()
        );
        assert_eq!(repo.list_for_connection(connection_id, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_orders_by_invoice_date() {
        let (db, connection_id) = setup().await;
        let repo = InvoiceRepository::new(db.clone());

        let mut older = record("a", 1, 100);
        older.invoice_date = NaiveDate::from_ymd_opt(2023, 6, 1);
        let mut newer = record("b", 2, 100);
        newer.invoice_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        upsert(&db, connection_id, &older).await;
        upsert(&db, connection_id, &newer).await;

        let listed = repo.list_for_connection(connection_id, 10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(repo.list_for_connection(connection_id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_never_decreases() {
        let (db, connection_id) = setup().await;
        let cursors = SyncCursorRepository::new(db.clone());
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();

        assert_eq!(cursors.get(connection_id).await.unwrap(), None);
        SyncCursorRepository::advance(&*db, connection_id, t1, Utc::now()).await.unwrap();
        let after = SyncCursorRepository::advance(&*db, connection_id, t0, Utc::now())
            .await
            .unwrap();
        assert_eq!(after, t1);
        assert_eq!(cursors.get(connection_id).await.unwrap(), Some(t1));
    }

    #[tokio::test]
    async fn test_customer_get_or_create_refreshes_name() {
        let (db, connection_id) = setup().await;
        let first = CustomerRepository::get_or_create(&*db, connection_id, "7", "Old Name", Utc::now())
            .await
            .unwrap();
        let second = CustomerRepository::get_or_create(&*db, connection_id, "7", "New Name", Utc::now())
            .await
            .unwrap();
        assert_eq!(first, second);

        let stored = crate::models::Customer::find_by_id(first)
            .one(&*db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "New Name");
    }
}
