//! # Invoice Handlers
//!
//! Read access to the locally mirrored invoices.

use axum::{extract::State, response::Json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::handlers::require_connection;
use crate::models::invoice;
use crate::repositories::MAX_LIST_LIMIT;
use crate::server::AppState;

/// A mirrored invoice
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceResponse {
    pub id: Uuid,
    /// QuickBooks invoice id
    pub external_id: String,
    pub doc_number: Option<String>,
    pub customer_id: Uuid,
    /// QuickBooks customer id
    pub customer_ref: String,
    /// Total in minor currency units
    pub amount_minor: i64,
    /// Outstanding balance in minor currency units
    pub open_balance_minor: i64,
    pub currency: Option<String>,
    /// `OPEN` or `PAID`
    pub status: String,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub source_last_modified: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

impl From<invoice::Model> for InvoiceResponse {
    fn from(model: invoice::Model) -> Self {
        Self {
            id: model.id,
            external_id: model.external_id,
            doc_number: model.doc_number,
            customer_id: model.customer_id,
            customer_ref: model.customer_ref,
            amount_minor: model.amount_minor,
            open_balance_minor: model.open_balance_minor,
            currency: model.currency,
            status: model.status,
            invoice_date: model.invoice_date,
            due_date: model.due_date,
            source_last_modified: model.source_last_modified,
            synced_at: model.synced_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InvoiceListResponse {
    pub invoices: Vec<InvoiceResponse>,
}

/// List mirrored invoices
///
/// Newest invoice date first, at most 1000 rows.
#[utoipa::path(
    get,
    path = "/api/v1/invoices",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Mirrored invoices", body = InvoiceListResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "QuickBooks is not connected", body = ApiError)
    ),
    tag = "invoices"
)]
pub async fn list_invoices(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<InvoiceListResponse>, ApiError> {
    let connection = require_connection(&state, &user.user_id).await?;
    let invoices = state
        .invoices
        .list_for_connection(connection.id, MAX_LIST_LIMIT)
        .await?
        .into_iter()
        .map(InvoiceResponse::from)
        .collect();

    Ok(Json(InvoiceListResponse { invoices }))
}
