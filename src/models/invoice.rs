//! Invoice entity model
//!
//! Mirrors QuickBooks invoices. `(connection_id, external_id)` is unique and rows are
//! only ever written by the sync executor.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

pub const STATUS_OPEN: &str = "OPEN";
pub const STATUS_PAID: &str = "PAID";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "invoices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub connection_id: Uuid,

    /// QuickBooks invoice `Id`
    pub external_id: String,

    pub doc_number: Option<String>,

    pub customer_id: Uuid,

    /// QuickBooks `CustomerRef.value`
    pub customer_ref: String,

    /// Total amount in minor currency units
    pub amount_minor: i64,

    /// Outstanding balance in minor currency units
    pub open_balance_minor: i64,

    pub currency: Option<String>,

    pub status: String,

    pub invoice_date: Option<Date>,

    pub due_date: Option<Date>,

    /// `MetaData.LastUpdatedTime` at the source; upserts never move this backwards
    pub source_last_modified: DateTimeUtc,

    /// When this service last wrote the row
    pub synced_at: DateTimeUtc,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
