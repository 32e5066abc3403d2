//! # Sync Handler

use axum::{extract::State, response::Json};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::handlers::require_connection;
use crate::server::AppState;
use crate::sync_executor::SyncReport;

/// Pull new and changed invoices from QuickBooks
///
/// Runs one incremental sync for the caller's connection and returns the counts.
/// Concurrent requests for the same connection run one after another. When
/// QuickBooks keeps failing, the 502 body's `details.progress` carries the counts
/// committed before the failure; the next run resumes from there.
#[utoipa::path(
    post,
    path = "/api/v1/quickbooks/sync",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Sync finished", body = SyncReport),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "QuickBooks is not connected", body = ApiError),
        (status = 409, description = "QuickBooks must be re-authorized", body = ApiError),
        (status = 502, description = "QuickBooks failed; partial progress in details", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn run_sync(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<SyncReport>, ApiError> {
    let connection = require_connection(&state, &user.user_id).await?;
    let report = state.sync.sync(connection.id).await?;
    Ok(Json(report))
}
