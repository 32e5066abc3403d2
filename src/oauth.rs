//! # QuickBooks OAuth flow
//!
//! Begins and completes the authorization-code flow. The `state` value is a
//! random single-use token stored server side together with the user who asked
//! for it; the callback consumes it before anything is sent to the provider.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;

use crate::connectors::QuickBooksOAuthClient;
use crate::repositories::{ConnectionRepository, ConsumedState, OAuthStateRepository};

/// Provider name stored with each state value
pub const PROVIDER: &str = "quickbooks";

/// Access token lifetime assumed when the provider omits `expires_in`
const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 3600;

/// Errors raised by the OAuth connector and token refresh
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth client is misconfigured: missing {0}")]
    MisconfiguredClient(String),

    #[error("invalid OAuth state: {0}")]
    InvalidState(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("authorization denied by provider: {0}")]
    AuthorizationDenied(String),

    #[error("token exchange failed: {message}")]
    TokenExchangeFailed {
        status: Option<u16>,
        message: String,
    },

    #[error("re-authorization required: {0}")]
    ReauthorizationRequired(String),

    #[error("failed to persist connection: {0}")]
    ConnectionPersist(String),

    #[error("QuickBooks is not connected for this user")]
    NotConnected,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Parameters delivered to the callback route
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub realm_id: Option<String>,
    pub error: Option<String>,
}

/// A started authorization
#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub redirect_url: Url,
    pub state: String,
}

/// A completed authorization
#[derive(Debug, Clone)]
pub struct CompletedAuthorization {
    pub realm_id: String,
    pub return_to: Option<String>,
}

#[derive(Clone)]
pub struct OAuthService {
    client: QuickBooksOAuthClient,
    states: OAuthStateRepository,
    connections: Arc<ConnectionRepository>,
    state_ttl_minutes: i64,
}

impl OAuthService {
    pub fn new(
        client: QuickBooksOAuthClient,
        states: OAuthStateRepository,
        connections: Arc<ConnectionRepository>,
        state_ttl_minutes: i64,
    ) -> Self {
        Self {
            client,
            states,
            connections,
            state_ttl_minutes,
        }
    }

    /// Issue a state for `user_id` and build the provider authorization URL.
    #[instrument(skip(self, return_to))]
    pub async fn begin(
        &self,
        user_id: &str,
        return_to: Option<String>,
    ) -> Result<AuthorizationStart, OAuthError> {
        self.client.ensure_configured()?;

        let state = generate_secure_state();
        let redirect_url = self.client.authorize_url(&state)?;

        self.states
            .create(user_id, PROVIDER, &state, return_to, self.state_ttl_minutes)
            .await
            .map_err(|e| OAuthError::Internal(anyhow::Error::new(e).context("store OAuth state")))?;

        if let Err(err) = self.states.cleanup_expired().await {
            warn!(error = %err, "Failed to clean up expired OAuth states");
        }

        info!(user_id, "QuickBooks authorization started");
        Ok(AuthorizationStart {
            redirect_url,
            state,
        })
    }

    /// Validate the callback, exchange the code and store the connection.
    #[instrument(skip_all, fields(realm_id = params.realm_id.as_deref().unwrap_or("")))]
    pub async fn complete(
        &self,
        params: CallbackParams,
    ) -> Result<CompletedAuthorization, OAuthError> {
        let state = params
            .state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OAuthError::InvalidState("missing state".to_string()))?;

        let issued = match self
            .states
            .consume(PROVIDER, &state)
            .await
            .map_err(|e| OAuthError::Internal(anyhow::Error::new(e).context("consume OAuth state")))?
        {
            ConsumedState::Valid(issued) => issued,
            ConsumedState::Expired => {
                return Err(OAuthError::InvalidState("state expired".to_string()));
            }
            ConsumedState::Unknown => {
                return Err(OAuthError::InvalidState(
                    "state unknown or already used".to_string(),
                ));
            }
        };

        if let Some(error) = params.error.filter(|e| !e.is_empty()) {
            warn!(user_id = %issued.user_id, %error, "Provider denied authorization");
            return Err(OAuthError::AuthorizationDenied(error));
        }

        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(OAuthError::MissingParameter("code"))?;
        let realm_id = params
            .realm_id
            .filter(|r| !r.is_empty())
            .ok_or(OAuthError::MissingParameter("realmId"))?;

        let grant = self.client.exchange_code(&code).await?;
        let refresh_token = grant.refresh_token.ok_or_else(|| OAuthError::TokenExchangeFailed {
            status: None,
            message: "token response did not include a refresh token".to_string(),
        })?;
        let expires_at = Utc::now()
            + grant
                .expires_in
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .unwrap_or_else(|| ChronoDuration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECS));

        let connection = self
            .connections
            .upsert_for_user(
                &issued.user_id,
                &realm_id,
                &grant.access_token,
                &refresh_token,
                expires_at,
            )
            .await
            .map_err(|e| OAuthError::ConnectionPersist(e.to_string()))?;

        info!(
            user_id = %issued.user_id,
            connection_id = %connection.id,
            "QuickBooks connected"
        );

        Ok(CompletedAuthorization {
            realm_id,
            return_to: issued.return_to,
        })
    }
}

/// 32 random bytes, base64url without padding
fn generate_secure_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64_url::encode(&bytes)
}
