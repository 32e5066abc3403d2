//! # Server Configuration
//!
//! Application state wiring, the router, and the serve loop with graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{JwtVerifier, bearer_auth_middleware};
use crate::config::AppConfig;
use crate::connectors::{InvoiceSource, QuickBooksClient, QuickBooksOAuthClient};
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::oauth::OAuthService;
use crate::repositories::{ConnectionRepository, InvoiceRepository, OAuthStateRepository};
use crate::sync_executor::{Clock, SyncExecutor, SystemClock};
use crate::telemetry::{TRACE_ID_HEADER, trace_context_middleware};
use crate::token_refresh::TokenRefreshService;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub verifier: Arc<JwtVerifier>,
    pub connections: Arc<ConnectionRepository>,
    pub invoices: InvoiceRepository,
    pub oauth: OAuthService,
    pub token_refresh: TokenRefreshService,
    pub sync: Arc<SyncExecutor>,
    pub qbo: Arc<QuickBooksClient>,
}

impl AppState {
    /// Build every service from configuration, using the wall clock for backoff.
    pub fn new(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<Self> {
        Self::with_clock(config, db, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AppConfig,
        db: DatabaseConnection,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let key_bytes = config
            .crypto_key
            .clone()
            .context("COLLECTIONS_CRYPTO_KEY is required")?;
        let crypto_key = CryptoKey::new(key_bytes)?;

        let db = Arc::new(db);
        let verifier = Arc::new(JwtVerifier::new(&config.identity)?);
        let connections = Arc::new(ConnectionRepository::new(db.clone(), crypto_key));
        let oauth_client = QuickBooksOAuthClient::new(&config.quickbooks)?;
        let qbo = Arc::new(QuickBooksClient::new(&config.quickbooks)?);

        let oauth = OAuthService::new(
            oauth_client.clone(),
            OAuthStateRepository::new(db.clone()),
            connections.clone(),
            config.quickbooks.oauth_state_ttl_minutes,
        );
        let token_refresh = TokenRefreshService::new(
            oauth_client,
            connections.clone(),
            config.quickbooks.token_refresh_margin_seconds,
        );
        let source: Arc<dyn InvoiceSource> = qbo.clone();
        let sync = Arc::new(SyncExecutor::new(
            db.clone(),
            source,
            token_refresh.clone(),
            clock,
            config.sync.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            invoices: InvoiceRepository::new(db),
            verifier,
            connections,
            oauth,
            token_refresh,
            sync,
            qbo,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/quickbooks/login", get(handlers::quickbooks_auth::login))
        .route("/api/v1/quickbooks/sync", post(handlers::sync::run_sync))
        .route("/api/v1/invoices", get(handlers::invoices::list_invoices))
        .route("/qbo/company", get(handlers::qbo::company_info))
        .route("/qbo/invoices/latest", get(handlers::qbo::latest_invoices))
        .route("/qbo/reports/ar-aging-detail", get(handlers::qbo::aging_detail))
        .route(
            "/qbo/reports/ar-aging-detail/simplified",
            get(handlers::qbo::aging_simplified),
        )
        .route_layer(middleware::from_fn_with_state(
            state.verifier.clone(),
            bearer_auth_middleware,
        ));

    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/quickbooks/callback", get(handlers::quickbooks_auth::callback))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, TRACE_ID_HEADER])
        .expose_headers([TRACE_ID_HEADER])
        .allow_credentials(true)
}

/// Serve until Ctrl-C or until `shutdown` is cancelled.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .with_context(|| format!("Invalid server address: {}", config.api_bind_addr))?;
    let profile = config.profile.clone();

    let app = create_app(AppState::new(config, db)?);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, %profile, "Server listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "Failed to listen for Ctrl-C");
                }
                tracing::info!("Shutdown signal received");
                signal_token.cancel();
            }
            _ = signal_token.cancelled() => {}
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

struct BearerSecurity;

impl Modify for BearerSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::health,
        crate::handlers::quickbooks_auth::login,
        crate::handlers::quickbooks_auth::callback,
        crate::handlers::sync::run_sync,
        crate::handlers::invoices::list_invoices,
        crate::handlers::qbo::company_info,
        crate::handlers::qbo::latest_invoices,
        crate::handlers::qbo::aging_detail,
        crate::handlers::qbo::aging_simplified,
    ),
    components(
        schemas(
            crate::models::HealthStatus,
            crate::error::ApiError,
            crate::error::ProviderError,
            crate::handlers::quickbooks_auth::LoginResponse,
            crate::handlers::quickbooks_auth::CallbackResponse,
            crate::handlers::invoices::InvoiceResponse,
            crate::handlers::invoices::InvoiceListResponse,
            crate::sync_executor::SyncReport,
            crate::sync_executor::FailedRecord,
            crate::aging::SimplifiedAgingReport,
            crate::aging::CustomerAging,
            crate::aging::AgingBuckets,
            crate::aging::OldestInvoice,
        )
    ),
    modifiers(&BearerSecurity),
    tags(
        (name = "health", description = "Liveness"),
        (name = "quickbooks", description = "QuickBooks OAuth connection"),
        (name = "sync", description = "Invoice synchronization"),
        (name = "invoices", description = "Mirrored invoices"),
        (name = "qbo", description = "Live QuickBooks reads"),
    ),
    info(
        title = "Collections Sync API",
        description = "QuickBooks Online invoice sync and A/R aging",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
