//! Connectors module
//!
//! QuickBooks Online integration:
//! - The `InvoiceSource` trait the sync executor pages through
//! - Typed invoice records mapped from the query payload
//! - OAuth and API clients for QuickBooks

pub mod quickbooks;
pub mod records;
pub mod trait_;

pub use quickbooks::{
    AgingReportParams, QuickBooksClient, QuickBooksOAuthClient, TokenGrant,
};
pub use records::InvoiceRecord;
pub use trait_::{
    ApiCredentials, InvoicePage, InvoiceSource, PageQuery, QuickBooksError, SourceRecord,
};
