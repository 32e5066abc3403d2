//! Connection entity model
//!
//! One QuickBooks authorization per user. Tokens are stored as AES-GCM ciphertext
//! (see [`crate::crypto`]) and never leave the repository layer in plaintext form
//! except through [`crate::repositories::ConnectionRepository::decrypt_tokens`].

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

pub const STATUS_ACTIVE: &str = "active";
/// The refresh token was rejected; the user must repeat the OAuth flow.
pub const STATUS_REAUTH_REQUIRED: &str = "reauth_required";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "qb_connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Identity provider subject that owns the connection (unique)
    pub user_id: String,

    /// QuickBooks company identifier
    pub realm_id: String,

    pub status: String,

    pub access_token_ciphertext: Vec<u8>,

    pub refresh_token_ciphertext: Vec<u8>,

    /// Access token expiry
    pub expires_at: DateTimeUtc,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::invoice::Entity")]
    Invoice,
    #[sea_orm(has_many = "super::customer::Entity")]
    Customer,
}

impl Related<super::invoice::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Invoice.def()
    }
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}
