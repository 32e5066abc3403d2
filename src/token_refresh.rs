//! # Token Refresh Service
//!
//! On-demand refresh of QuickBooks access tokens. Callers ask for credentials
//! before talking to the API; tokens expiring within the safety margin are
//! exchanged first. Refreshes for one connection are single-flight.

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::connectors::{ApiCredentials, QuickBooksOAuthClient};
use crate::keyed_lock::KeyedLocks;
use crate::models::connection;
use crate::oauth::OAuthError;
use crate::repositories::ConnectionRepository;

/// Access token lifetime assumed when the provider omits `expires_in`
const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 3600;

const MAX_MARGIN_SECS: u64 = 86_400;

#[derive(Clone)]
pub struct TokenRefreshService {
    oauth_client: QuickBooksOAuthClient,
    connection_repo: Arc<ConnectionRepository>,
    margin: Duration,
    in_flight_refreshes: KeyedLocks,
}

impl TokenRefreshService {
    pub fn new(
        oauth_client: QuickBooksOAuthClient,
        connection_repo: Arc<ConnectionRepository>,
        margin_seconds: u64,
    ) -> Self {
        Self {
            oauth_client,
            connection_repo,
            margin: Duration::seconds(margin_seconds.min(MAX_MARGIN_SECS) as i64),
            in_flight_refreshes: KeyedLocks::new(),
        }
    }

    /// Credentials that stay valid for at least the safety margin.
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self, connection_id: Uuid) -> Result<ApiCredentials, OAuthError> {
        let _guard = self.in_flight_refreshes.lock(connection_id).await;
        let connection = self.load_active(connection_id).await?;

        if !self.needs_refresh(connection.expires_at, Utc::now()) {
            debug!("Access token still valid");
            return self.credentials(&connection);
        }

        self.refresh_locked(connection).await
    }

    /// Refresh after the API rejected `rejected_access_token`.
    ///
    /// If another task already replaced that token, its result is reused instead
    /// of refreshing a second time.
    #[instrument(skip(self, rejected_access_token))]
    pub async fn force_refresh(
        &self,
        connection_id: Uuid,
        rejected_access_token: &str,
    ) -> Result<ApiCredentials, OAuthError> {
        let _guard = self.in_flight_refreshes.lock(connection_id).await;
        let connection = self.load_active(connection_id).await?;

        let current = self.credentials(&connection)?;
        if current.access_token != rejected_access_token
            && !self.needs_refresh(connection.expires_at, Utc::now())
        {
            debug!("Token already refreshed by a concurrent caller");
            return Ok(current);
        }

        self.refresh_locked(connection).await
    }

    fn needs_refresh(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at <= now + self.margin
    }

    async fn load_active(&self, connection_id: Uuid) -> Result<connection::Model, OAuthError> {
        let connection = self
            .connection_repo
            .get_by_id(connection_id)
            .await?
            .ok_or(OAuthError::NotConnected)?;

        if !connection.is_active() {
            return Err(OAuthError::ReauthorizationRequired(
                "connection is awaiting re-authorization".to_string(),
            ));
        }
        Ok(connection)
    }

    fn credentials(&self, connection: &connection::Model) -> Result<ApiCredentials, OAuthError> {
        let tokens = self.connection_repo.decrypt_tokens(connection)?;
        Ok(ApiCredentials {
            realm_id: connection.realm_id.clone(),
            access_token: tokens.access_token,
        })
    }

    /// Exchange the refresh token. Caller holds the connection's lock.
    async fn refresh_locked(
        &self,
        connection: connection::Model,
    ) -> Result<ApiCredentials, OAuthError> {
        let refresh_start = std::time::Instant::now();
        counter!("token_refresh_attempts_total").increment(1);

        let tokens = self.connection_repo.decrypt_tokens(&connection)?;

        let grant = match self.oauth_client.refresh(&tokens.refresh_token).await {
            Ok(grant) => grant,
            Err(OAuthError::ReauthorizationRequired(reason)) => {
                counter!("token_refresh_failure_total", "reason" => "rejected").increment(1);
                warn!(connection_id = %connection.id, %reason, "Refresh token rejected");
                if let Err(err) = self.connection_repo.mark_reauth_required(connection.id).await {
                    error!(error = ?err, "Failed to flag connection for re-authorization");
                }
                return Err(OAuthError::ReauthorizationRequired(reason));
            }
            Err(err) => {
                counter!("token_refresh_failure_total", "reason" => "exchange").increment(1);
                return Err(err);
            }
        };

        let refresh_token = grant.refresh_token.unwrap_or(tokens.refresh_token);
        let expires_at = Utc::now()
            + grant
                .expires_in
                .and_then(|d| Duration::from_std(d).ok())
                .unwrap_or_else(|| Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECS));

        let updated = self
            .connection_repo
            .update_tokens(&connection, &grant.access_token, &refresh_token, expires_at)
            .await?;

        counter!("token_refresh_success_total").increment(1);
        histogram!("token_refresh_duration_ms")
            .record(refresh_start.elapsed().as_secs_f64() * 1_000.0);
        info!(connection_id = %updated.id, %expires_at, "Access token refreshed");

        Ok(ApiCredentials {
            realm_id: updated.realm_id,
            access_token: grant.access_token,
        })
    }
}
