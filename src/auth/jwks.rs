//! Bearer token verification against the identity provider.
//!
//! Asymmetric tokens are checked with the key from the provider's JWKS document
//! whose `kid` matches the token header; HS* tokens use the shared secret.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::Context;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind};
use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use super::{AuthError, AuthenticatedUser, Claims};
use crate::config::IdentityConfig;

const KEY_CACHE_CAPACITY: usize = 64;

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JsonWebKey>,
}

/// JSON Web Key for JWT signature verification
#[derive(Debug, Deserialize, Clone)]
struct JsonWebKey {
    kty: String,
    kid: Option<String>,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

impl JsonWebKey {
    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        let component = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| AuthError::InvalidToken(format!("signing key is missing '{name}'")))
        };

        let key = match self.kty.as_str() {
            "RSA" => DecodingKey::from_rsa_components(&component(&self.n, "n")?, &component(&self.e, "e")?),
            "EC" => DecodingKey::from_ec_components(&component(&self.x, "x")?, &component(&self.y, "y")?),
            "OKP" => DecodingKey::from_ed_components(&component(&self.x, "x")?),
            other => {
                return Err(AuthError::InvalidToken(format!(
                    "unsupported signing key type '{other}'"
                )));
            }
        };

        key.map_err(|e| AuthError::InvalidToken(format!("unusable signing key: {e}")))
    }
}

struct KeyCache {
    keys: LruCache<String, JsonWebKey>,
    fetched_at: Option<Instant>,
}

impl KeyCache {
    fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|at| at.elapsed())
    }
}

/// Verifies bearer JWTs and yields the authenticated principal.
///
/// The JWKS document is cached for the configured TTL. A token whose `kid` is
/// not cached forces one refetch, but refetches triggered this way are spaced
/// at least `jwks_min_refresh_seconds` apart. Concurrent misses share a single
/// fetch.
pub struct JwtVerifier {
    http_client: Client,
    jwks_url: Option<String>,
    api_key: Option<String>,
    shared_secret: Option<String>,
    issuer: Option<String>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<KeyCache>,
    refresh_lock: Mutex<()>,
}

impl JwtVerifier {
    pub fn new(identity: &IdentityConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(identity.jwks_timeout_seconds))
            .build()
            .context("Failed to build JWKS HTTP client")?;

        let capacity = NonZeroUsize::new(KEY_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            http_client,
            jwks_url: identity.supabase_jwks_url.clone(),
            api_key: identity.supabase_anon_key.clone(),
            shared_secret: identity.supabase_jwt_secret.clone(),
            issuer: identity.expected_issuer(),
            cache_ttl: Duration::from_secs(identity.jwks_cache_ttl_seconds),
            min_refresh_interval: Duration::from_secs(identity.jwks_min_refresh_seconds),
            cache: RwLock::new(KeyCache {
                keys: LruCache::new(capacity),
                fetched_at: None,
            }),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Verify a raw token (without the `Bearer ` prefix).
    pub async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed token header: {e}")))?;

        let decoding_key = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = self.shared_secret.as_deref().ok_or_else(|| {
                    AuthError::InvalidToken("HMAC-signed tokens are not accepted".to_string())
                })?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            alg => {
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| AuthError::InvalidToken("token header has no 'kid'".to_string()))?;
                let jwk = self.signing_key(kid).await?;
                if let Some(key_alg) = jwk.alg.as_deref()
                    && key_alg != format!("{alg:?}")
                {
                    return Err(AuthError::InvalidToken(format!(
                        "token algorithm {alg:?} does not match key algorithm {key_alg}"
                    )));
                }
                jwk.decoding_key()?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<Claims>(token, &decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty 'sub' claim".to_string()));
        }

        Ok(AuthenticatedUser {
            user_id: data.claims.sub.clone(),
            claims: data.claims,
        })
    }

    async fn signing_key(&self, kid: &str) -> Result<JsonWebKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if cache.age().is_some_and(|age| age < self.cache_ttl)
                && let Some(jwk) = cache.keys.peek(kid)
            {
                return Ok(jwk.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited.
        let stale = {
            let cache = self.cache.read().await;
            let cached = cache.keys.peek(kid).cloned();
            match (cached, cache.age()) {
                (Some(jwk), Some(age)) if age < self.cache_ttl => return Ok(jwk),
                (None, Some(age)) if age < self.min_refresh_interval => {
                    return Err(AuthError::UnknownSigningKey(kid.to_string()));
                }
                (cached, _) => cached,
            }
        };

        let jwks = match self.fetch_jwks().await {
            Ok(jwks) => jwks,
            Err(err) => {
                if let Some(jwk) = stale {
                    tracing::warn!(error = %err, kid, "JWKS refresh failed; using cached key");
                    return Ok(jwk);
                }
                return Err(err);
            }
        };

        let mut cache = self.cache.write().await;
        cache.keys.clear();
        for key in jwks.keys {
            if let Some(key_id) = key.kid.clone() {
                cache.keys.put(key_id, key);
            }
        }
        cache.fetched_at = Some(Instant::now());
        tracing::debug!(keys = cache.keys.len(), "Refreshed JWKS cache");

        cache
            .keys
            .peek(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownSigningKey(kid.to_string()))
    }

    async fn fetch_jwks(&self) -> Result<JwksResponse, AuthError> {
        let url = self.jwks_url.as_deref().ok_or_else(|| {
            AuthError::InvalidToken("asymmetric tokens are not accepted".to_string())
        })?;

        let mut request = self.http_client.get(url);
        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::KeysUnavailable(format!("failed to fetch JWKS: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::KeysUnavailable(format!(
                "JWKS request failed with status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::KeysUnavailable(format!("failed to parse JWKS: {e}")))
    }
}
