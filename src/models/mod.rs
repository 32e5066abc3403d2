//! # Data Models
//!
//! SeaORM entities for connections, OAuth states, customers, invoices and sync cursors.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod customer;
pub mod invoice;
pub mod oauth_state;
pub mod sync_cursor;

pub use connection::Entity as Connection;
pub use customer::Entity as Customer;
pub use invoice::Entity as Invoice;
pub use oauth_state::Entity as OAuthState;
pub use sync_cursor::Entity as SyncCursor;

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    /// Always `true` while the process is serving requests
    pub ok: bool,
}
