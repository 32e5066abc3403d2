//! # Error Handling
//!
//! Unified problem+json responses with trace id propagation, plus the mapping
//! from each component's error taxonomy onto HTTP statuses and stable codes.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::auth::AuthError;
use crate::connectors::QuickBooksError;
use crate::oauth::OAuthError;
use crate::sync_executor::SyncError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<C: Into<String>, M: Into<String>>(status: StatusCode, code: C, message: M) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Current request trace id, or a generated correlation id outside a request scope
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}

/// Upstream provider error information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderError {
    /// Provider identifier
    pub provider: String,
    /// HTTP status code from upstream
    pub status: u16,
    /// Response body snippet from upstream (truncated)
    pub body_snippet: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::MissingCredentials(reason) => {
                Self::new(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", reason)
            }
            AuthError::InvalidToken(reason) => {
                tracing::debug!(%reason, "Rejected bearer token");
                Self::new(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Invalid token")
            }
            AuthError::ExpiredToken => {
                Self::new(StatusCode::UNAUTHORIZED, "EXPIRED_TOKEN", "Token expired")
            }
            AuthError::UnknownSigningKey(kid) => Self::new(
                StatusCode::UNAUTHORIZED,
                "UNKNOWN_SIGNING_KEY",
                "Token signed by an unknown key",
            )
            .with_details(json!({ "kid": kid })),
            AuthError::KeysUnavailable(reason) => {
                tracing::warn!(%reason, "Identity provider keys unavailable");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "IDENTITY_PROVIDER_UNAVAILABLE",
                    "Unable to verify token right now; try again later",
                )
            }
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(error: OAuthError) -> Self {
        match error {
            OAuthError::MisconfiguredClient(missing) => {
                tracing::error!(%missing, "QuickBooks OAuth client is misconfigured");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "MISCONFIGURED_CLIENT",
                    "QuickBooks integration is not configured",
                )
                .with_details(json!({ "missing": missing }))
            }
            OAuthError::InvalidState(reason) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_STATE", reason)
            }
            OAuthError::MissingParameter(name) => {
                let mut fields = serde_json::Map::new();
                fields.insert(name.to_string(), json!("Required parameter is missing"));
                validation_error(
                    "Missing required query parameter",
                    serde_json::Value::Object(fields),
                )
            }
            OAuthError::AuthorizationDenied(reason) => Self::new(
                StatusCode::BAD_REQUEST,
                "AUTHORIZATION_DENIED",
                "QuickBooks authorization was not granted",
            )
            .with_details(json!({ "error": reason })),
            OAuthError::TokenExchangeFailed { status, message } => {
                tracing::warn!(?status, %message, "QuickBooks token endpoint failure");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "TOKEN_EXCHANGE_FAILED",
                    "QuickBooks token exchange failed; try again later",
                )
                .with_details(json!({ "upstream_status": status }))
            }
            OAuthError::ReauthorizationRequired(reason) => Self::new(
                StatusCode::CONFLICT,
                "REAUTHORIZATION_REQUIRED",
                "QuickBooks authorization expired; reconnect QuickBooks",
            )
            .with_details(json!({ "reason": reason })),
            OAuthError::ConnectionPersist(reason) => {
                tracing::error!(%reason, "Failed to persist QuickBooks connection");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONNECTION_PERSIST_ERROR",
                    "Failed to save QuickBooks connection",
                )
            }
            OAuthError::NotConnected => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_CONNECTED",
                "QuickBooks is not connected for this user",
            ),
            OAuthError::Internal(err) => err.into(),
        }
    }
}

impl From<QuickBooksError> for ApiError {
    fn from(error: QuickBooksError) -> Self {
        match error {
            QuickBooksError::RateLimited { retry_after_secs } => {
                let err = provider_error(
                    "quickbooks".to_string(),
                    429,
                    Some("rate limited".to_string()),
                );
                match retry_after_secs {
                    Some(seconds) => err.with_retry_after(seconds),
                    None => err,
                }
            }
            QuickBooksError::Unauthorized { body } => {
                provider_error("quickbooks".to_string(), 401, Some(body))
            }
            QuickBooksError::Permanent { status, body } => {
                provider_error("quickbooks".to_string(), status, Some(body))
            }
            QuickBooksError::Transient { status, message } => {
                provider_error("quickbooks".to_string(), status.unwrap_or(0), Some(message))
            }
            QuickBooksError::Malformed(message) => Self::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                "QuickBooks returned an unexpected response",
            )
            .with_details(json!({ "reason": truncate(&message) })),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Authorization(err) => err.into(),
            SyncError::RetriesExhausted {
                report,
                attempts,
                last_error,
            } => Self::new(
                StatusCode::BAD_GATEWAY,
                "SYNC_RETRIES_EXHAUSTED",
                "QuickBooks kept failing; sync stopped and can be resumed later",
            )
            .with_details(json!({
                "attempts": attempts,
                "last_error": last_error.to_string(),
                "progress": report,
            })),
            SyncError::Provider { report, error } => {
                let base: ApiError = error.into();
                let mut details = base
                    .details
                    .as_deref()
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                if let Some(obj) = details.as_object_mut() {
                    obj.insert("progress".to_string(), json!(report));
                }
                base.with_details(details)
            }
            SyncError::Storage { report, message } => {
                tracing::error!(%message, "Sync aborted by storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Failed to store synced invoices",
                )
                .with_details(json!({ "progress": report }))
            }
        }
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// Create a provider upstream error. All upstream failures surface as 502.
pub fn provider_error(provider: String, status: u16, body: Option<String>) -> ApiError {
    let provider_error = ProviderError {
        provider: provider.clone(),
        status,
        body_snippet: body.as_deref().map(truncate),
    };

    ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR",
        format!("Provider {} returned error status {}", provider, status),
    )
    .with_details(json!(provider_error))
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_executor::SyncReport;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
    }

    #[test]
    fn test_content_type_and_retry_after_headers() {
        let response = ApiError::new(StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", "busy")
            .with_retry_after(60)
            .into_response();

        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_trace_id_generation_outside_request() {
        let error = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "X", "Test error");
        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn test_auth_errors_map_to_401_with_distinct_codes() {
        let cases = [
            (AuthError::InvalidToken("bad".into()), "INVALID_TOKEN"),
            (AuthError::ExpiredToken, "EXPIRED_TOKEN"),
            (
                AuthError::UnknownSigningKey("kid-1".into()),
                "UNKNOWN_SIGNING_KEY",
            ),
        ];
        for (error, code) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, StatusCode::UNAUTHORIZED);
            assert_eq!(&*api.code, code);
        }
    }

    #[test]
    fn test_oauth_error_statuses() {
        let misconfigured: ApiError = OAuthError::MisconfiguredClient("client_id".into()).into();
        assert_eq!(misconfigured.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&*misconfigured.code, "MISCONFIGURED_CLIENT");

        let state: ApiError = OAuthError::InvalidState("replayed".into()).into();
        assert_eq!(state.status, StatusCode::BAD_REQUEST);

        let exchange: ApiError = OAuthError::TokenExchangeFailed {
            status: Some(400),
            message: "invalid_grant".into(),
        }
        .into();
        assert_eq!(exchange.status, StatusCode::BAD_GATEWAY);
        assert_eq!(&*exchange.code, "TOKEN_EXCHANGE_FAILED");

        let reauth: ApiError = OAuthError::ReauthorizationRequired("invalid_grant".into()).into();
        assert_eq!(reauth.status, StatusCode::CONFLICT);
        assert_eq!(&*reauth.code, "REAUTHORIZATION_REQUIRED");

        let persist: ApiError = OAuthError::ConnectionPersist("db down".into()).into();
        assert_eq!(persist.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&*persist.code, "CONNECTION_PERSIST_ERROR");
    }

    #[test]
    fn test_retries_exhausted_carries_partial_progress() {
        let report = SyncReport {
            created: 3,
            updated: 1,
            ..SyncReport::default()
        };
        let api: ApiError = SyncError::RetriesExhausted {
            report,
            attempts: 5,
            last_error: QuickBooksError::Transient {
                status: Some(503),
                message: "unavailable".into(),
            },
        }
        .into();

        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(&*api.code, "SYNC_RETRIES_EXHAUSTED");
        let details = api.details.unwrap();
        assert_eq!(details["progress"]["created"], 3);
        assert_eq!(details["progress"]["updated"], 1);
        assert_eq!(details["attempts"], 5);
    }

    #[test]
    fn test_provider_error_truncates_body() {
        let error = provider_error("quickbooks".to_string(), 400, Some("x".repeat(500)));
        let details = error.details.unwrap();
        let snippet = details["body_snippet"].as_str().unwrap();
        assert_eq!(snippet.chars().count(), 203);
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
    }
}
