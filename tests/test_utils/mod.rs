//! Shared helpers for integration tests.
//!
//! Builds the full application against an in-memory SQLite database and a
//! wiremock server standing in for Intuit (token endpoint and accounting API).

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collections_sync::config::{AppConfig, IdentityConfig, QuickBooksConfig, SyncPolicyConfig};
use collections_sync::server::{AppState, create_app};
use collections_sync::sync_executor::Clock;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const CRYPTO_KEY: [u8; 32] = [7u8; 32];
pub const REALM_ID: &str = "9130350";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration pointing every QuickBooks endpoint at `mock`.
pub fn test_config(mock: &MockServer) -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        database_url: "sqlite::memory:".to_string(),
        crypto_key: Some(CRYPTO_KEY.to_vec()),
        identity: IdentityConfig {
            supabase_jwt_secret: Some(JWT_SECRET.to_string()),
            ..IdentityConfig::default()
        },
        quickbooks: QuickBooksConfig {
            client_id: Some("test-client-id".to_string()),
            client_secret: Some("test-client-secret".to_string()),
            redirect_url: Some("http://localhost:8080/auth/quickbooks/callback".to_string()),
            authorize_url: "https://appcenter.intuit.com/connect/oauth2".to_string(),
            token_url: format!("{}/oauth2/v1/tokens/bearer", mock.uri()),
            api_base: Some(mock.uri()),
            timeout_seconds: 5,
            ..QuickBooksConfig::default()
        },
        sync: SyncPolicyConfig {
            page_size: 2,
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            jitter_factor: 0.0,
            max_pages: 50,
        },
        ..AppConfig::default()
    }
}

/// HS256 bearer token for `user_id`, expiring `exp_offset` seconds from now.
pub fn bearer_token(user_id: &str, exp_offset: i64) -> String {
    let claims = json!({
        "sub": user_id,
        "exp": Utc::now().timestamp() + exp_offset,
        "role": "authenticated",
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("sign test token")
}

/// Clock that records requested sleeps and returns immediately.
#[derive(Default)]
pub struct RecordingClock {
    pub sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Clock for RecordingClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// A running application bound to an ephemeral port.
pub struct TestApp {
    pub base_url: String,
    pub state: AppState,
    pub clock: Arc<RecordingClock>,
    /// Client that does not follow redirects
    pub client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_authed(&self, path: &str, user_id: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(bearer_token(user_id, 300))
            .send()
            .await
            .expect("request")
    }

    pub async fn post_authed(&self, path: &str, user_id: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(bearer_token(user_id, 300))
            .send()
            .await
            .expect("request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_app(config: AppConfig) -> TestApp {
    let db = setup_test_db().await.expect("test database");
    let clock = Arc::new(RecordingClock::default());
    let state = AppState::with_clock(config, db, clock.clone()).expect("app state");
    let app = create_app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .expect("server");
    });

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("http client");

    TestApp {
        base_url: format!("http://{}", addr),
        state,
        clock,
        client,
        shutdown,
    }
}

/// Store a connection for `user_id` whose access token is valid for an hour.
pub async fn connect_user(app: &TestApp, user_id: &str) -> uuid::Uuid {
    app.state
        .connections
        .upsert_for_user(
            user_id,
            REALM_ID,
            "access-token-1",
            "refresh-token-1",
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .expect("store connection")
        .id
}

/// A QuickBooks invoice object as returned by the query endpoint.
pub fn qbo_invoice(id: &str, customer: &str, balance: &str, updated: &str) -> serde_json::Value {
    json!({
        "Id": id,
        "DocNumber": format!("INV-{}", id),
        "TxnDate": "2026-09-01",
        "DueDate": "2026-10-01",
        "TotalAmt": 150.25,
        "Balance": balance.parse::<f64>().unwrap_or(0.0),
        "CurrencyRef": { "value": "USD", "name": "United States Dollar" },
        "CustomerRef": { "value": format!("C-{}", customer), "name": customer },
        "MetaData": {
            "CreateTime": "2026-09-01T10:00:00-07:00",
            "LastUpdatedTime": updated
        }
    })
}

pub fn query_response(invoices: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "QueryResponse": {
            "Invoice": invoices,
            "startPosition": 1,
            "maxResults": 2
        },
        "time": "2026-10-17T09:00:00.000-07:00"
    })
}
