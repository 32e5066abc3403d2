//! # OAuth State Model
//!
//! Single-use state values issued by the login route and consumed by the callback.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// User that started the authorization
    pub user_id: String,

    /// Provider name (always "quickbooks" today)
    pub provider: String,

    /// Opaque state token sent to the provider
    pub state: String,

    /// Where to send the browser after a successful callback
    pub return_to: Option<String>,

    pub expires_at: chrono::DateTime<chrono::Utc>,

    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
