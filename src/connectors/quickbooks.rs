//! QuickBooks Online connector
//!
//! Two clients live here: [`QuickBooksOAuthClient`] speaks the Intuit OAuth2
//! endpoints through the `oauth2` crate, and [`QuickBooksClient`] calls the
//! accounting API (queries and reports) and implements [`InvoiceSource`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, SecondsFormat};
use oauth2::basic::{BasicClient, BasicErrorResponseType};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;
use utoipa::IntoParams;

use super::records::parse_invoice_page;
use super::trait_::{ApiCredentials, InvoicePage, InvoiceSource, PageQuery, QuickBooksError};
use crate::config::QuickBooksConfig;
use crate::oauth::OAuthError;

/// Scope requested during authorization
pub const ACCOUNTING_SCOPE: &str = "com.intuit.quickbooks.accounting";
/// API minor version pinned for every call
pub const MINOR_VERSION: &str = "73";

const MAX_BODY_SNIPPET: usize = 512;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Tokens returned by the token endpoint
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// OAuth2 client for the Intuit authorization and token endpoints
#[derive(Clone)]
pub struct QuickBooksOAuthClient {
    config: QuickBooksConfig,
    http_client: Client,
}

impl QuickBooksOAuthClient {
    pub fn new(config: &QuickBooksConfig) -> anyhow::Result<Self> {
        // Token endpoints must not follow redirects.
        let http_client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build QuickBooks OAuth HTTP client")?;

        Ok(Self {
            config: config.clone(),
            http_client,
        })
    }

    /// Fails with `MisconfiguredClient` naming the first missing setting.
    fn client(&self) -> Result<ConfiguredClient, OAuthError> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| OAuthError::MisconfiguredClient(name.to_string()))
        };

        let client_id = required(&self.config.client_id, "QBO_CLIENT_ID")?;
        let client_secret = required(&self.config.client_secret, "QBO_CLIENT_SECRET")?;
        let redirect_url = required(&self.config.redirect_url, "QBO_REDIRECT_URL")?;

        let auth_url = AuthUrl::new(self.config.authorize_url.clone())
            .map_err(|e| OAuthError::MisconfiguredClient(format!("QBO_AUTHORIZE_URL: {e}")))?;
        let token_url = TokenUrl::new(self.config.token_url.clone())
            .map_err(|e| OAuthError::MisconfiguredClient(format!("QBO_TOKEN_URL: {e}")))?;
        let redirect_url = RedirectUrl::new(redirect_url)
            .map_err(|e| OAuthError::MisconfiguredClient(format!("QBO_REDIRECT_URL: {e}")))?;

        Ok(BasicClient::new(ClientId::new(client_id))
            .set_client_secret(ClientSecret::new(client_secret))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url))
    }

    /// Check that every setting needed for the flow is present.
    pub fn ensure_configured(&self) -> Result<(), OAuthError> {
        self.client().map(|_| ())
    }

    /// Authorization URL carrying `state`
    pub fn authorize_url(&self, state: &str) -> Result<Url, OAuthError> {
        let state = state.to_string();
        let (url, _) = self
            .client()?
            .authorize_url(move || CsrfToken::new(state))
            .add_scope(Scope::new(ACCOUNTING_SCOPE.to_string()))
            .url();
        Ok(url)
    }

    /// Exchange an authorization code. Every failure is `TokenExchangeFailed`.
    #[instrument(skip_all)]
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, OAuthError> {
        let response = self
            .client()?
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|err| {
                let message = describe_token_error(&err);
                warn!(%message, "Authorization code exchange failed");
                OAuthError::TokenExchangeFailed {
                    status: None,
                    message,
                }
            })?;

        Ok(grant_from(&response))
    }

    /// Exchange a refresh token.
    ///
    /// A rejected grant means the user has to authorize again; anything else is
    /// reported as a failed exchange.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, OAuthError> {
        let response = self
            .client()?
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|err| {
                let message = describe_token_error(&err);
                match &err {
                    RequestTokenError::ServerResponse(response)
                        if matches!(
                            response.error(),
                            BasicErrorResponseType::InvalidGrant
                                | BasicErrorResponseType::UnauthorizedClient
                        ) =>
                    {
                        OAuthError::ReauthorizationRequired(message)
                    }
                    _ => OAuthError::TokenExchangeFailed {
                        status: None,
                        message,
                    },
                }
            })?;

        Ok(grant_from(&response))
    }
}

fn grant_from<T: TokenResponse>(response: &T) -> TokenGrant {
    TokenGrant {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_in: response.expires_in(),
    }
}

fn describe_token_error<RE, T>(err: &RequestTokenError<RE, T>) -> String
where
    RE: std::error::Error + 'static,
    T: oauth2::ErrorResponse + std::fmt::Display,
{
    match err {
        RequestTokenError::ServerResponse(response) => response.to_string(),
        RequestTokenError::Request(e) => format!("request failed: {e}"),
        RequestTokenError::Parse(e, _) => format!("unreadable token response: {e}"),
        RequestTokenError::Other(message) => message.clone(),
    }
}

/// Query parameters for the `AgedReceivableDetail` report
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AgingReportParams {
    /// Report date (YYYY-MM-DD)
    pub report_date: Option<NaiveDate>,
    /// Only past-due balances
    pub past_due: Option<bool>,
    /// `Report_Date` or `Current`
    pub aging_method: Option<String>,
    /// Number of aging periods (1-6)
    pub num_periods: Option<u8>,
    /// Comma separated column list
    pub columns: Option<String>,
}

impl AgingReportParams {
    /// Reject values QuickBooks would refuse, naming the offending field.
    pub fn validate(&self) -> Result<(), (&'static str, String)> {
        if let Some(n) = self.num_periods
            && !(1..=6).contains(&n)
        {
            return Err(("num_periods", "Must be between 1 and 6".to_string()));
        }
        if let Some(method) = &self.aging_method
            && !matches!(method.to_ascii_lowercase().as_str(), "report_date" | "current")
        {
            return Err((
                "aging_method",
                "Must be Report_Date or Current".to_string(),
            ));
        }
        Ok(())
    }

    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("minorversion", MINOR_VERSION.to_string())];
        if let Some(date) = self.report_date {
            query.push(("report_date", date.format("%Y-%m-%d").to_string()));
        }
        if let Some(past_due) = self.past_due {
            query.push(("pastdue", past_due.to_string()));
        }
        if let Some(method) = &self.aging_method {
            query.push(("aging_method", method.clone()));
        }
        if let Some(n) = self.num_periods {
            query.push(("num_periods", n.to_string()));
        }
        if let Some(columns) = &self.columns {
            query.push(("columns", columns.clone()));
        }
        query
    }
}

/// Client for the QuickBooks accounting API
#[derive(Clone)]
pub struct QuickBooksClient {
    http_client: Client,
    api_base: String,
}

impl QuickBooksClient {
    pub fn new(config: &QuickBooksConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build QuickBooks API HTTP client")?;

        Ok(Self {
            http_client,
            api_base: config.effective_api_base().trim_end_matches('/').to_string(),
        })
    }

    fn company_url(&self, realm_id: &str, path: &str) -> String {
        format!("{}/v3/company/{}/{}", self.api_base, realm_id, path)
    }

    /// Run a QuickBooks query statement and return the raw JSON payload.
    #[instrument(skip(self, credentials), fields(realm_id = %credentials.realm_id))]
    pub async fn query(
        &self,
        credentials: &ApiCredentials,
        statement: &str,
    ) -> Result<Value, QuickBooksError> {
        debug!(statement, "Running QuickBooks query");
        let response = self
            .http_client
            .post(self.company_url(&credentials.realm_id, "query"))
            .query(&[("minorversion", MINOR_VERSION)])
            .bearer_auth(&credentials.access_token)
            .header("Accept", "application/json")
            .header("Content-Type", "text/plain")
            .body(statement.to_string())
            .send()
            .await
            .map_err(transport_error)?;

        read_json(response).await
    }

    pub async fn company_info(&self, credentials: &ApiCredentials) -> Result<Value, QuickBooksError> {
        self.query(credentials, "SELECT * FROM CompanyInfo").await
    }

    /// Most recently created invoices, newest first
    pub async fn latest_invoices(
        &self,
        credentials: &ApiCredentials,
        limit: u32,
    ) -> Result<Value, QuickBooksError> {
        let statement = format!(
            "SELECT * FROM Invoice ORDER BY MetaData.CreateTime DESC MAXRESULTS {}",
            limit
        );
        self.query(credentials, &statement).await
    }

    #[instrument(skip(self, credentials), fields(realm_id = %credentials.realm_id))]
    pub async fn aged_receivable_detail(
        &self,
        credentials: &ApiCredentials,
        params: &AgingReportParams,
    ) -> Result<Value, QuickBooksError> {
        let response = self
            .http_client
            .get(self.company_url(&credentials.realm_id, "reports/AgedReceivableDetail"))
            .query(&params.to_query())
            .bearer_auth(&credentials.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        read_json(response).await
    }
}

/// Query statement for one page of the incremental invoice listing
pub fn invoice_page_statement(query: &PageQuery) -> String {
    let mut statement = String::from("SELECT * FROM Invoice");
    if let Some(since) = query.modified_since {
        statement.push_str(&format!(
            " WHERE MetaData.LastUpdatedTime >= '{}'",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    statement.push_str(&format!(
        " ORDER BY MetaData.LastUpdatedTime STARTPOSITION {} MAXRESULTS {}",
        query.skip.saturating_add(1),
        query.page_size
    ));
    statement
}

#[async_trait]
impl InvoiceSource for QuickBooksClient {
    async fn fetch_invoices(
        &self,
        credentials: &ApiCredentials,
        query: &PageQuery,
    ) -> Result<InvoicePage, QuickBooksError> {
        let body = self
            .query(credentials, &invoice_page_statement(query))
            .await?;
        let records = parse_invoice_page(body)?;
        let has_more = query.page_size > 0 && records.len() as u32 >= query.page_size;

        Ok(InvoicePage { records, has_more })
    }
}

fn transport_error(err: reqwest::Error) -> QuickBooksError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    QuickBooksError::Transient {
        status: None,
        message: format!("{}: {}", kind, err),
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, QuickBooksError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|e| QuickBooksError::Malformed(format!("invalid JSON body: {}", e)));
    }

    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = snippet(response.text().await.unwrap_or_default());

    Err(match status {
        StatusCode::UNAUTHORIZED => QuickBooksError::Unauthorized { body },
        StatusCode::TOO_MANY_REQUESTS => QuickBooksError::RateLimited {
            retry_after_secs: retry_after,
        },
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            QuickBooksError::Transient {
                status: Some(s.as_u16()),
                message: body,
            }
        }
        s => QuickBooksError::Permanent {
            status: s.as_u16(),
            body,
        },
    })
}

fn snippet(body: String) -> String {
    if body.chars().count() > MAX_BODY_SNIPPET {
        body.chars().take(MAX_BODY_SNIPPET).collect()
    } else {
        body
    }
}
