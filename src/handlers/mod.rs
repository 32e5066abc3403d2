//! # API Handlers
//!
//! HTTP endpoint handlers. Everything except `/health` and the OAuth callback
//! sits behind the bearer middleware.

pub mod invoices;
pub mod qbo;
pub mod quickbooks_auth;
pub mod sync;

use axum::response::Json;

use crate::error::ApiError;
use crate::models::{HealthStatus, connection};
use crate::oauth::OAuthError;
use crate::server::AppState;

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthStatus)
    ),
    tag = "health"
)]
pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus { ok: true })
}

/// The caller's QuickBooks connection, or `NOT_CONNECTED`
pub(crate) async fn require_connection(
    state: &AppState,
    user_id: &str,
) -> Result<connection::Model, ApiError> {
    state
        .connections
        .find_by_user(user_id)
        .await?
        .ok_or_else(|| OAuthError::NotConnected.into())
}
