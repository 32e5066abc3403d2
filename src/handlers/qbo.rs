//! # QuickBooks Passthrough Handlers
//!
//! Live reads against the QuickBooks API using the caller's connection. Tokens are
//! refreshed first when they are close to expiry.

use axum::{
    extract::{Query, State},
    response::Json,
};
use chrono::Utc;
use serde_json::{Value, json};

use crate::aging::{SimplifiedAgingReport, simplify_aging_report};
use crate::auth::AuthenticatedUser;
use crate::connectors::{AgingReportParams, ApiCredentials};
use crate::error::{ApiError, validation_error};
use crate::handlers::require_connection;
use crate::server::AppState;

const LATEST_INVOICE_LIMIT: u32 = 25;

async fn credentials(state: &AppState, user: &AuthenticatedUser) -> Result<ApiCredentials, ApiError> {
    let connection = require_connection(state, &user.user_id).await?;
    Ok(state.token_refresh.ensure_fresh(connection.id).await?)
}

fn validated(params: &AgingReportParams) -> Result<(), ApiError> {
    params.validate().map_err(|(field, reason)| {
        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), json!(reason));
        validation_error("Invalid report parameters", Value::Object(fields))
    })
}

/// Company information for the connected realm
#[utoipa::path(
    get,
    path = "/qbo/company",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Raw CompanyInfo query response", body = serde_json::Value),
        (status = 404, description = "QuickBooks is not connected", body = ApiError),
        (status = 409, description = "QuickBooks must be re-authorized", body = ApiError),
        (status = 502, description = "QuickBooks request failed", body = ApiError)
    ),
    tag = "qbo"
)]
pub async fn company_info(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let creds = credentials(&state, &user).await?;
    Ok(Json(state.qbo.company_info(&creds).await?))
}

/// The 25 most recently created invoices, straight from QuickBooks
#[utoipa::path(
    get,
    path = "/qbo/invoices/latest",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Raw invoice query response", body = serde_json::Value),
        (status = 404, description = "QuickBooks is not connected", body = ApiError),
        (status = 409, description = "QuickBooks must be re-authorized", body = ApiError),
        (status = 502, description = "QuickBooks request failed", body = ApiError)
    ),
    tag = "qbo"
)]
pub async fn latest_invoices(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let creds = credentials(&state, &user).await?;
    Ok(Json(state.qbo.latest_invoices(&creds, LATEST_INVOICE_LIMIT).await?))
}

/// A/R aging detail report as returned by QuickBooks
#[utoipa::path(
    get,
    path = "/qbo/reports/ar-aging-detail",
    security(("bearer_auth" = [])),
    params(AgingReportParams),
    responses(
        (status = 200, description = "Raw AgedReceivableDetail report", body = serde_json::Value),
        (status = 400, description = "Invalid report parameters", body = ApiError),
        (status = 404, description = "QuickBooks is not connected", body = ApiError),
        (status = 502, description = "QuickBooks request failed", body = ApiError)
    ),
    tag = "qbo"
)]
pub async fn aging_detail(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<AgingReportParams>,
) -> Result<Json<Value>, ApiError> {
    validated(&params)?;
    let creds = credentials(&state, &user).await?;
    Ok(Json(state.qbo.aged_receivable_detail(&creds, &params).await?))
}

/// A/R aging summarized per customer with a recommended collection action
#[utoipa::path(
    get,
    path = "/qbo/reports/ar-aging-detail/simplified",
    security(("bearer_auth" = [])),
    params(AgingReportParams),
    responses(
        (status = 200, description = "Per-customer aging buckets", body = SimplifiedAgingReport),
        (status = 400, description = "Invalid report parameters", body = ApiError),
        (status = 404, description = "QuickBooks is not connected", body = ApiError),
        (status = 502, description = "QuickBooks request failed", body = ApiError)
    ),
    tag = "qbo"
)]
pub async fn aging_simplified(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<AgingReportParams>,
) -> Result<Json<SimplifiedAgingReport>, ApiError> {
    validated(&params)?;
    let creds = credentials(&state, &user).await?;
    let report = state.qbo.aged_receivable_detail(&creds, &params).await?;
    Ok(Json(simplify_aging_report(&report, Utc::now().date_naive())))
}
