//! # Authentication
//!
//! Bearer JWT authentication for user-facing endpoints. The middleware verifies
//! the token and stores the principal in request extensions, where handlers
//! pick it up through the [`AuthenticatedUser`] extractor.

mod jwks;

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jwks::JwtVerifier;

use crate::error::ApiError;

/// Token verification failures
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    ExpiredToken,
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),
    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(String),
}

/// Claims read from a verified token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The verified principal of a request
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Stable identifier (the token's `sub`)
    pub user_id: String,
    pub claims: Claims,
}

/// Authentication middleware that verifies the bearer token
pub async fn bearer_auth_middleware(
    State(verifier): State<Arc<JwtVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?.to_owned();
    let user = verifier.verify(&token).await?;

    tracing::debug!(user_id = %user.user_id, "Authenticated request");
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredentials("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AuthError::MissingCredentials("Invalid Authorization header"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or(AuthError::MissingCredentials(
            "Authorization header must use Bearer scheme",
        ))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingCredentials(
            "Authorization header must use Bearer scheme",
        ));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingCredentials("Bearer token is empty"));
    }
    Ok(token)
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| AuthError::MissingCredentials("Authentication required").into())
    }
}
