//! # QuickBooks Authorization Handlers
//!
//! Login starts the Intuit consent flow for the authenticated user; the callback
//! is hit by the browser on its way back from Intuit and carries no bearer token.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header::LOCATION},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;
use utoipa::{IntoParams, ToSchema};

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, validation_error};
use crate::oauth::CallbackParams;
use crate::server::AppState;

const CONNECTED_MESSAGE: &str = "Connected to QuickBooks";

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LoginQuery {
    /// Return the authorization URL as JSON instead of redirecting
    #[serde(default)]
    pub return_url: bool,
    /// Absolute http(s) URL to send the browser to once connected
    pub return_to: Option<String>,
}

/// Authorization URL returned when `return_url=true`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub redirect_url: String,
    pub state: String,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// QuickBooks company id
    #[serde(rename = "realmId")]
    pub realm_id: Option<String>,
    /// Set by Intuit when the user declines consent
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CallbackResponse {
    pub ok: bool,
    pub message: String,
    pub realm_id: String,
}

/// Start the QuickBooks OAuth flow
#[utoipa::path(
    get,
    path = "/auth/quickbooks/login",
    security(("bearer_auth" = [])),
    params(LoginQuery),
    responses(
        (status = 302, description = "Redirect to the Intuit consent page"),
        (status = 200, description = "Authorization URL (return_url=true)", body = LoginResponse),
        (status = 400, description = "Invalid return_to", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 500, description = "QuickBooks client not configured", body = ApiError)
    ),
    tag = "quickbooks"
)]
pub async fn login(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<LoginQuery>,
) -> Result<Response, ApiError> {
    if let Some(return_to) = query.return_to.as_deref() {
        validate_return_to(return_to)?;
    }

    let start = state.oauth.begin(&user.user_id, query.return_to).await?;

    if query.return_url {
        return Ok(Json(LoginResponse {
            redirect_url: start.redirect_url.to_string(),
            state: start.state,
        })
        .into_response());
    }

    Ok((StatusCode::FOUND, [(LOCATION, start.redirect_url.to_string())]).into_response())
}

/// Complete the QuickBooks OAuth flow
#[utoipa::path(
    get,
    path = "/auth/quickbooks/callback",
    params(CallbackQuery),
    responses(
        (status = 200, description = "Connection stored", body = CallbackResponse),
        (status = 303, description = "Connection stored; redirect to the stored return_to"),
        (status = 400, description = "Invalid, expired or replayed state, or missing parameter", body = ApiError),
        (status = 500, description = "Connection could not be saved", body = ApiError),
        (status = 502, description = "Token exchange failed", body = ApiError)
    ),
    tag = "quickbooks"
)]
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let completed = state
        .oauth
        .complete(CallbackParams {
            code: query.code,
            state: query.state,
            realm_id: query.realm_id,
            error: query.error,
        })
        .await?;

    if let Some(return_to) = completed.return_to.as_deref()
        && let Ok(mut target) = Url::parse(return_to)
    {
        target
            .query_pairs_mut()
            .append_pair("ok", "true")
            .append_pair("message", CONNECTED_MESSAGE)
            .append_pair("realmId", &completed.realm_id);
        return Ok((StatusCode::SEE_OTHER, [(LOCATION, target.to_string())]).into_response());
    }

    Ok(Json(CallbackResponse {
        ok: true,
        message: CONNECTED_MESSAGE.to_string(),
        realm_id: completed.realm_id,
    })
    .into_response())
}

fn validate_return_to(return_to: &str) -> Result<(), ApiError> {
    match Url::parse(return_to) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
        _ => Err(validation_error(
            "Invalid return_to",
            json!({ "return_to": "Must be an absolute http(s) URL" }),
        )),
    }
}
