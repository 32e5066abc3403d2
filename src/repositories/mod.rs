//! Repositories
//!
//! Thin data-access layer over the SeaORM entities.

pub mod connection;
pub mod customer;
pub mod invoice;
pub mod oauth_state;
pub mod sync_cursor;

pub use connection::{ConnectionRepository, ConnectionTokens};
pub use customer::CustomerRepository;
pub use invoice::{InvoiceRepository, MAX_LIST_LIMIT, UpsertOutcome};
pub use oauth_state::{ConsumedState, OAuthStateRepository};
pub use sync_cursor::SyncCursorRepository;
