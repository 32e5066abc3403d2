//! Invoice source trait
//!
//! The seam between the sync executor and the QuickBooks API. The executor only
//! sees typed pages and classified errors; tests substitute scripted sources.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::records::InvoiceRecord;

/// Classified failures from the QuickBooks API
#[derive(Debug, Clone, PartialEq)]
pub enum QuickBooksError {
    /// 401 from the API; the access token is no longer accepted
    Unauthorized { body: String },
    /// 429 with the optional `Retry-After` hint
    RateLimited { retry_after_secs: Option<u64> },
    /// Timeouts, connection failures and 5xx responses
    Transient { status: Option<u16>, message: String },
    /// Any other 4xx
    Permanent { status: u16, body: String },
    /// The response body did not have the expected shape
    Malformed(String),
}

impl QuickBooksError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuickBooksError::RateLimited { .. } | QuickBooksError::Transient { .. }
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            QuickBooksError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

impl std::fmt::Display for QuickBooksError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuickBooksError::Unauthorized { body } => write!(f, "Unauthorized: {}", body),
            QuickBooksError::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
                Ok(())
            }
            QuickBooksError::Transient { status, message } => match status {
                Some(status) => write!(f, "Transient error {}: {}", status, message),
                None => write!(f, "Transient error: {}", message),
            },
            QuickBooksError::Permanent { status, body } => {
                write!(f, "HTTP error {}: {}", status, body)
            }
            QuickBooksError::Malformed(details) => write!(f, "Malformed response: {}", details),
        }
    }
}

impl std::error::Error for QuickBooksError {}

/// Realm and bearer token for one API call
#[derive(Clone)]
pub struct ApiCredentials {
    pub realm_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("realm_id", &self.realm_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// One page request against the invoice listing
///
/// Pages are keyed on the committed cursor: every request starts at
/// `modified_since` and skips only records already seen at that instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    /// Lower bound (inclusive) on the source last-modified time
    pub modified_since: Option<DateTime<Utc>>,
    /// Leading records of the ordered listing to pass over
    pub skip: u32,
    pub page_size: u32,
}

/// A record as delivered by the source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Invoice(InvoiceRecord),
    /// The record could not be mapped to [`InvoiceRecord`]
    Malformed {
        external_id: Option<String>,
        reason: String,
    },
}

/// One page of the invoice listing, ordered by last-modified time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoicePage {
    pub records: Vec<SourceRecord>,
    /// The page was full, so more records may follow
    pub has_more: bool,
}

#[async_trait]
pub trait InvoiceSource: Send + Sync {
    /// Fetch one page of invoices modified at or after `query.modified_since`.
    async fn fetch_invoices(
        &self,
        credentials: &ApiCredentials,
        query: &PageQuery,
    ) -> Result<InvoicePage, QuickBooksError>;
}
