//! Customer repository
//!
//! Customers are created lazily while invoices are synced; all writes run inside
//! the page transaction of the sync executor.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::models::customer::{self, Entity as Customer};

pub struct CustomerRepository;

impl CustomerRepository {
    /// Resolve the local id for a QuickBooks customer reference, creating the row
    /// on first sight and refreshing the display name when it changed.
    pub async fn get_or_create<C: ConnectionTrait>(
        conn: &C,
        connection_id: Uuid,
        external_ref: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let existing = Customer::find()
            .filter(customer::Column::ConnectionId.eq(connection_id))
            .filter(customer::Column::ExternalRef.eq(external_ref))
            .one(conn)
            .await?;

        if let Some(existing) = existing {
            let id = existing.id;
            if existing.name != name {
                let mut active: customer::ActiveModel = existing.into();
                active.name = Set(name.to_string());
                active.updated_at = Set(now);
                active.update(conn).await?;
            }
            return Ok(id);
        }

        let id = Uuid::new_v4();
        let active = customer::ActiveModel {
            id: Set(id),
            connection_id: Set(connection_id),
            external_ref: Set(external_ref.to_string()),
            name: Set(name.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Customer::insert(active).exec_without_returning(conn).await?;

        Ok(id)
    }
}
