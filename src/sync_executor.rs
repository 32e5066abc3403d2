//! Sync Executor
//!
//! Pages through the QuickBooks invoice listing for one connection and mirrors
//! every record locally. Each page is fetched first and then written in a single
//! transaction that also advances the connection's cursor, so a failed run can
//! resume after the last committed page.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::SyncPolicyConfig;
use crate::connectors::{
    ApiCredentials, InvoicePage, InvoiceSource, PageQuery, QuickBooksError, SourceRecord,
};
use crate::keyed_lock::KeyedLocks;
use crate::oauth::OAuthError;
use crate::repositories::{
    CustomerRepository, InvoiceRepository, SyncCursorRepository, UpsertOutcome,
};
use crate::token_refresh::TokenRefreshService;

/// Failed records listed in a report; the `failed` counter keeps counting past it
pub const MAX_REPORTED_FAILURES: usize = 50;

/// Time source for the retry loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A record that could not be stored
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FailedRecord {
    /// QuickBooks invoice id, when the payload had one
    pub external_id: Option<String>,
    pub reason: String,
}

/// Outcome of a sync run. On failure it carries what was committed before the error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct SyncReport {
    pub created: u64,
    pub updated: u64,
    /// Records at or behind the stored version
    pub unchanged: u64,
    /// Records that could not be mapped
    pub failed: u64,
    /// Pages committed
    pub pages: u32,
    /// First failed records, capped
    pub failures: Vec<FailedRecord>,
    /// Cursor after the last committed page
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Authorization(OAuthError),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        report: SyncReport,
        attempts: u32,
        last_error: QuickBooksError,
    },

    #[error("QuickBooks request failed: {error}")]
    Provider {
        report: SyncReport,
        error: QuickBooksError,
    },

    #[error("storage failure: {message}")]
    Storage { report: SyncReport, message: String },
}

/// Delay before retry number `attempt + 1`.
///
/// `base * 2^attempt` capped at the policy maximum, stretched to any
/// `Retry-After` hint, plus up to `jitter_factor` of itself scaled by
/// `jitter_sample` (expected in `0.0..1.0`).
pub fn calculate_backoff(
    policy: &SyncPolicyConfig,
    attempt: u32,
    retry_after_secs: Option<u64>,
    jitter_sample: f64,
) -> Duration {
    let base = policy.backoff_base_ms as f64;
    let max = policy.backoff_max_ms as f64;

    let mut backoff_ms = (base * 2_f64.powi(attempt.min(32) as i32)).min(max);
    if let Some(retry_after) = retry_after_secs {
        backoff_ms = backoff_ms.max(retry_after as f64 * 1_000.0);
    }

    let jitter_ms = policy.jitter_factor * backoff_ms * jitter_sample.clamp(0.0, 1.0);
    Duration::from_millis((backoff_ms + jitter_ms).round() as u64)
}

/// Last-modified time of each record in page order; `None` for malformed ones
fn record_stamps(page: &InvoicePage) -> Vec<Option<DateTime<Utc>>> {
    page.records
        .iter()
        .map(|record| match record {
            SourceRecord::Invoice(invoice) => Some(invoice.last_modified),
            SourceRecord::Malformed { .. } => None,
        })
        .collect()
}

/// Records the next query from `cursor` has to pass over.
///
/// A page ordered by last-modified time ends with the records stamped with its
/// newest time, followed by anything newer that failed to parse. That tail is
/// exactly the head of the listing from the new cursor. When the cursor did not
/// move the whole page is still ahead of the same starting point.
fn next_skip(
    query: &PageQuery,
    stamps: &[Option<DateTime<Utc>>],
    cursor: Option<DateTime<Utc>>,
) -> u32 {
    let len = stamps.len() as u32;
    if cursor == query.modified_since {
        return query.skip.saturating_add(len);
    }
    match stamps.iter().position(|stamp| stamp.is_some() && *stamp == cursor) {
        Some(first_at_cursor) => len - first_at_cursor as u32,
        None => 0,
    }
}

/// Per-page tallies, merged into the report after the page commits
#[derive(Default)]
struct PageOutcome {
    created: u64,
    updated: u64,
    unchanged: u64,
    failures: Vec<FailedRecord>,
    cursor: Option<DateTime<Utc>>,
}

pub struct SyncExecutor {
    db: Arc<DatabaseConnection>,
    source: Arc<dyn InvoiceSource>,
    token_refresh: TokenRefreshService,
    cursors: SyncCursorRepository,
    clock: Arc<dyn Clock>,
    policy: SyncPolicyConfig,
    locks: KeyedLocks,
}

impl SyncExecutor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        source: Arc<dyn InvoiceSource>,
        token_refresh: TokenRefreshService,
        clock: Arc<dyn Clock>,
        policy: SyncPolicyConfig,
    ) -> Self {
        Self {
            cursors: SyncCursorRepository::new(db.clone()),
            db,
            source,
            token_refresh,
            clock,
            policy,
            locks: KeyedLocks::new(),
        }
    }

    /// Run one sync for `connection_id`. Concurrent calls for the same
    /// connection wait for each other.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn sync(&self, connection_id: Uuid) -> Result<SyncReport, SyncError> {
        let _guard = self.locks.lock(connection_id).await;
        let started = std::time::Instant::now();
        counter!("sync_runs_total").increment(1);

        let result = self.run(connection_id).await;

        histogram!("sync_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        match &result {
            Ok(report) => {
                counter!("sync_runs_succeeded_total").increment(1);
                info!(
                    created = report.created,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    failed = report.failed,
                    pages = report.pages,
                    "Sync completed"
                );
            }
            Err(err) => {
                counter!("sync_runs_failed_total").increment(1);
                warn!(error = %err, "Sync failed");
            }
        }
        result
    }

    async fn run(&self, connection_id: Uuid) -> Result<SyncReport, SyncError> {
        let mut credentials = self
            .token_refresh
            .ensure_fresh(connection_id)
            .await
            .map_err(SyncError::Authorization)?;

        let modified_since =
            self.cursors
                .get(connection_id)
                .await
                .map_err(|e| SyncError::Storage {
                    report: SyncReport::default(),
                    message: e.to_string(),
                })?;
        debug!(?modified_since, "Starting from cursor");

        let mut report = SyncReport {
            cursor: modified_since,
            ..SyncReport::default()
        };
        let mut skip: u32 = 0;

        loop {
            if report.pages >= self.policy.max_pages {
                warn!(max_pages = self.policy.max_pages, "Page limit reached; stopping early");
                break;
            }

            let query = PageQuery {
                modified_since: report.cursor,
                skip,
                page_size: self.policy.page_size,
            };

            let page = self
                .fetch_with_retry(connection_id, &mut credentials, &query, &report)
                .await?;
            let has_more = page.has_more;
            let stamps = record_stamps(&page);

            self.commit_page(connection_id, page, &mut report).await?;
            counter!("sync_pages_total").increment(1);

            if !has_more {
                break;
            }
            skip = next_skip(&query, &stamps, report.cursor);
            debug!(cursor = ?report.cursor, skip, "Requesting next page");
        }

        Ok(report)
    }

    async fn fetch_with_retry(
        &self,
        connection_id: Uuid,
        credentials: &mut ApiCredentials,
        query: &PageQuery,
        report: &SyncReport,
    ) -> Result<InvoicePage, SyncError> {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let error = match self.source.fetch_invoices(credentials, query).await {
                Ok(page) => return Ok(page),
                Err(error) => error,
            };

            match error {
                QuickBooksError::Unauthorized { .. } if !refreshed => {
                    refreshed = true;
                    info!("Access token rejected; refreshing once");
                    *credentials = self
                        .token_refresh
                        .force_refresh(connection_id, &credentials.access_token)
                        .await
                        .map_err(SyncError::Authorization)?;
                }
                QuickBooksError::Unauthorized { body } => {
                    return Err(SyncError::Authorization(
                        OAuthError::ReauthorizationRequired(format!(
                            "QuickBooks rejected a freshly refreshed token: {}",
                            body
                        )),
                    ));
                }
                error if error.is_transient() => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(SyncError::RetriesExhausted {
                            report: report.clone(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = calculate_backoff(
                        &self.policy,
                        attempt - 1,
                        error.retry_after_secs(),
                        thread_rng().r#gen::<f64>(),
                    );
                    counter!("sync_retries_total").increment(1);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient QuickBooks failure; retrying page"
                    );
                    self.clock.sleep(delay).await;
                }
                error => {
                    return Err(SyncError::Provider {
                        report: report.clone(),
                        error,
                    });
                }
            }
        }
    }

    async fn commit_page(
        &self,
        connection_id: Uuid,
        page: InvoicePage,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let outcome = match self.write_page(connection_id, page).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(SyncError::Storage {
                    report: report.clone(),
                    message: format!("{:#}", err),
                });
            }
        };

        report.created += outcome.created;
        report.updated += outcome.updated;
        report.unchanged += outcome.unchanged;
        report.failed += outcome.failures.len() as u64;
        for failure in outcome.failures {
            if report.failures.len() < MAX_REPORTED_FAILURES {
                report.failures.push(failure);
            }
        }
        if outcome.cursor.is_some() {
            report.cursor = outcome.cursor;
        }
        report.pages += 1;
        Ok(())
    }

    async fn write_page(&self, connection_id: Uuid, page: InvoicePage) -> anyhow::Result<PageOutcome> {
        let now = self.clock.now();
        let mut outcome = PageOutcome::default();
        let mut newest: Option<DateTime<Utc>> = None;

        let txn = self.db.begin().await?;

        for record in page.records {
            let invoice = match record {
                SourceRecord::Invoice(invoice) => invoice,
                SourceRecord::Malformed {
                    external_id,
                    reason,
                } => {
                    warn!(?external_id, %reason, "Skipping malformed invoice");
                    counter!("sync_records_total", "outcome" => "failed").increment(1);
                    outcome.failures.push(FailedRecord {
                        external_id,
                        reason,
                    });
                    continue;
                }
            };

            let customer_id = CustomerRepository::get_or_create(
                &txn,
                connection_id,
                &invoice.customer_ref,
                &invoice.customer_name,
                now,
            )
            .await?;

            match InvoiceRepository::upsert(&txn, connection_id, customer_id, &invoice, now).await? {
                UpsertOutcome::Created => outcome.created += 1,
                UpsertOutcome::Updated => outcome.updated += 1,
                UpsertOutcome::Unchanged => outcome.unchanged += 1,
            }

            newest = Some(newest.map_or(invoice.last_modified, |n| n.max(invoice.last_modified)));
        }

        if let Some(newest) = newest {
            outcome.cursor =
                Some(SyncCursorRepository::advance(&txn, connection_id, newest, now).await?);
        }

        txn.commit().await?;

        counter!("sync_records_total", "outcome" => "created").increment(outcome.created);
        counter!("sync_records_total", "outcome" => "updated").increment(outcome.updated);
        counter!("sync_records_total", "outcome" => "unchanged").increment(outcome.unchanged);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuickBooksConfig;
    use crate::connectors::{InvoiceRecord, QuickBooksOAuthClient};
    use crate::crypto::CryptoKey;
    use crate::repositories::ConnectionRepository;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    fn policy() -> SyncPolicyConfig {
        SyncPolicyConfig {
            page_size: 2,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_factor: 0.0,
            max_pages: 100,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn invoice(id: &str, modified: DateTime<Utc>, balance: i64) -> InvoiceRecord {
        InvoiceRecord {
            external_id: id.to_string(),
            doc_number: Some(format!("DOC-{}", id)),
            customer_ref: "C1".to_string(),
            customer_name: "Acme".to_string(),
            amount_minor: 10_000,
            open_balance_minor: balance,
            currency: Some("USD".to_string()),
            status: if balance > 0 { "OPEN" } else { "PAID" }.to_string(),
            invoice_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            due_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            last_modified: modified,
        }
    }

    #[derive(Default)]
    struct FakeClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    /// Serves stored invoices the way the query API does: filtered by the
    /// watermark, ordered by last-modified time, paged by position.
    #[derive(Default)]
    struct FakeQuickBooks {
        invoices: Mutex<Vec<InvoiceRecord>>,
        /// Errors returned, in order, for requests starting at a watermark
        failures: Mutex<HashMap<Option<DateTime<Utc>>, VecDeque<QuickBooksError>>>,
        /// Upstream edits applied just before the request with that index
        edits: Mutex<HashMap<usize, InvoiceRecord>>,
        queries: Mutex<Vec<PageQuery>>,
    }

    impl FakeQuickBooks {
        fn with(invoices: Vec<InvoiceRecord>) -> Self {
            Self {
                invoices: Mutex::new(invoices),
                ..Self::default()
            }
        }

        fn fail_from(&self, since: Option<DateTime<Utc>>, errors: Vec<QuickBooksError>) {
            self.failures.lock().unwrap().insert(since, errors.into());
        }

        fn clear_failures(&self) {
            self.failures.lock().unwrap().clear();
        }

        fn edit_before_request(&self, request: usize, record: InvoiceRecord) {
            self.edits.lock().unwrap().insert(request, record);
        }
    }

    #[async_trait]
    impl InvoiceSource for FakeQuickBooks {
        async fn fetch_invoices(
            &self,
            _credentials: &ApiCredentials,
            query: &PageQuery,
        ) -> Result<InvoicePage, QuickBooksError> {
            let request = {
                let mut queries = self.queries.lock().unwrap();
                queries.push(query.clone());
                queries.len() - 1
            };

            if let Some(edit) = self.edits.lock().unwrap().remove(&request) {
                let mut invoices = self.invoices.lock().unwrap();
                invoices.retain(|r| r.external_id != edit.external_id);
                invoices.push(edit);
            }

            if let Some(queue) = self.failures.lock().unwrap().get_mut(&query.modified_since)
                && let Some(error) = queue.pop_front()
            {
                return Err(error);
            }

            let mut matching: Vec<_> = self
                .invoices
                .lock()
                .unwrap()
                .iter()
                .filter(|r| query.modified_since.is_none_or(|since| r.last_modified >= since))
                .cloned()
                .collect();
            matching.sort_by_key(|r| r.last_modified);

            let page_size = query.page_size as usize;
            let records: Vec<_> = matching
                .into_iter()
                .skip(query.skip as usize)
                .take(page_size)
                .map(SourceRecord::Invoice)
                .collect();
            let has_more = records.len() == page_size;

            Ok(InvoicePage { records, has_more })
        }
    }

    /// Returns canned responses in order and records the tokens it was given.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<InvoicePage, QuickBooksError>>>,
        tokens_seen: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<InvoicePage, QuickBooksError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl InvoiceSource for ScriptedSource {
        async fn fetch_invoices(
            &self,
            credentials: &ApiCredentials,
            _query: &PageQuery,
        ) -> Result<InvoicePage, QuickBooksError> {
            self.tokens_seen
                .lock()
                .unwrap()
                .push(credentials.access_token.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(InvoicePage::default()))
        }
    }

    struct Harness {
        db: Arc<DatabaseConnection>,
        connection_id: Uuid,
        clock: Arc<FakeClock>,
        executor: SyncExecutor,
    }

    async fn harness(source: Arc<dyn InvoiceSource>, token_url: Option<String>) -> Harness {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let db = Arc::new(db);

        let connections = Arc::new(ConnectionRepository::new(
            db.clone(),
            CryptoKey::new(vec![4u8; 32]).unwrap(),
        ));
        let connection = connections
            .upsert_for_user("user-1", "realm-1", "access-0", "refresh-0", Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();

        let qbo = QuickBooksConfig {
            client_id: Some("client-id".into()),
            client_secret: Some("client-secret".into()),
            redirect_url: Some("http://localhost/callback".into()),
            token_url: token_url.unwrap_or_else(|| "http://127.0.0.1:9/token".into()),
            ..QuickBooksConfig::default()
        };
        let token_refresh =
            TokenRefreshService::new(QuickBooksOAuthClient::new(&qbo).unwrap(), connections, 60);

        let clock = Arc::new(FakeClock::default());
        let executor = SyncExecutor::new(db.clone(), source, token_refresh, clock.clone(), policy());

        Harness {
            db,
            connection_id: connection.id,
            clock,
            executor,
        }
    }

    fn five_invoices() -> Vec<InvoiceRecord> {
        (1..=5).map(|i| invoice(&i.to_string(), at(i), 500)).collect()
    }

    #[test]
    fn test_calculate_backoff() {
        let policy = policy();
        assert_eq!(calculate_backoff(&policy, 0, None, 0.0), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&policy, 1, None, 0.0), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&policy, 3, None, 0.0), Duration::from_millis(800));
        assert_eq!(calculate_backoff(&policy, 10, None, 0.0), Duration::from_millis(1_000));
        assert_eq!(calculate_backoff(&policy, 0, Some(7), 0.0), Duration::from_secs(7));
        assert_eq!(calculate_backoff(&policy, 40, None, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_calculate_backoff_jitter_is_bounded() {
        let policy = SyncPolicyConfig {
            jitter_factor: 0.5,
            ..policy()
        };
        assert_eq!(calculate_backoff(&policy, 1, None, 0.0), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&policy, 1, None, 0.5), Duration::from_millis(250));
        assert_eq!(calculate_backoff(&policy, 1, None, 2.0), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_second_run_without_upstream_changes_is_idempotent() {
        let source = Arc::new(FakeQuickBooks::with(five_invoices()));
        let h = harness(source.clone(), None).await;

        let first = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!(first.created, 5);
        assert_eq!(first.pages, 3);
        assert_eq!(first.cursor, Some(at(5)));

        let second = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!((second.created, second.updated, second.failed), (0, 0, 0));
        assert_eq!(second.unchanged, 1);

        let last_query = source.queries.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last_query.modified_since, Some(at(5)));

        let stored = InvoiceRepository::new(h.db.clone())
            .list_for_connection(h.connection_id, 100)
            .await
            .unwrap();
        assert_eq!(stored.len(), 5);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_with_backoff() {
        let source = Arc::new(FakeQuickBooks::with(five_invoices()));
        source.fail_from(
            Some(at(2)),
            vec![
                QuickBooksError::Transient {
                    status: Some(503),
                    message: "unavailable".into(),
                },
                QuickBooksError::RateLimited {
                    retry_after_secs: Some(2),
                },
            ],
        );
        let h = harness(source, None).await;

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!(report.created, 5);
        assert_eq!(
            *h.clock.sleeps.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_committed_cursor_and_resume() {
        let source = Arc::new(FakeQuickBooks::with(five_invoices()));
        source.fail_from(
            Some(at(2)),
            (0..10)
                .map(|_| QuickBooksError::Transient {
                    status: None,
                    message: "timed out".into(),
                })
                .collect(),
        );
        let h = harness(source.clone(), None).await;

        let err = h.executor.sync(h.connection_id).await.unwrap_err();
        match err {
            SyncError::RetriesExhausted {
                report, attempts, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(report.created, 2);
                assert_eq!(report.pages, 1);
                assert_eq!(report.cursor, Some(at(2)));
            }
            other => panic!("expected exhausted retries, got {:?}", other),
        }
        assert_eq!(h.clock.sleeps.lock().unwrap().len(), 2);
        assert_eq!(
            SyncCursorRepository::new(h.db.clone())
                .get(h.connection_id)
                .await
                .unwrap(),
            Some(at(2))
        );

        source.clear_failures();
        let resumed = h.executor.sync(h.connection_id).await.unwrap();
        let first_resumed_query = source.queries.lock().unwrap()[4].clone();
        assert_eq!(first_resumed_query.modified_since, Some(at(2)));
        assert_eq!(first_resumed_query.skip, 0);
        assert_eq!(resumed.created, 3);
        assert_eq!(resumed.unchanged, 1);
        assert_eq!(resumed.cursor, Some(at(5)));
    }

    #[tokio::test]
    async fn test_permanent_error_aborts_without_retry() {
        let source = Arc::new(FakeQuickBooks::with(five_invoices()));
        source.fail_from(
            None,
            vec![QuickBooksError::Permanent {
                status: 400,
                body: "QueryValidationError".into(),
            }],
        );
        let h = harness(source, None).await;

        let err = h.executor.sync(h.connection_id).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Provider {
                error: QuickBooksError::Permanent { status: 400, .. },
                ..
            }
        ));
        assert!(h.clock.sleeps.lock().unwrap().is_empty());
        assert_eq!(
            SyncCursorRepository::new(h.db.clone())
                .get(h.connection_id)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_older_version_never_overwrites_newer() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(InvoicePage {
                records: vec![SourceRecord::Invoice(invoice("INV-1", at(10), 0))],
                has_more: true,
            }),
            Ok(InvoicePage {
                records: vec![SourceRecord::Invoice(invoice("INV-1", at(9), 999))],
                has_more: false,
            }),
        ]));
        let h = harness(source, None).await;

        // Older copy already mirrored.
        {
            let txn = h.db.begin().await.unwrap();
            let customer_id =
                CustomerRepository::get_or_create(&txn, h.connection_id, "C1", "Acme", Utc::now())
                    .await
                    .unwrap();
            InvoiceRepository::upsert(&txn, h.connection_id, customer_id, &invoice("INV-1", at(8), 500), Utc::now())
                .await
                .unwrap();
            txn.commit().await.unwrap();
        }

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.created, 0);
        assert_eq!(report.cursor, Some(at(10)));

        let stored = InvoiceRepository::new(h.db.clone())
            .find_by_external_id(h.connection_id, "INV-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.source_last_modified, at(10));
        assert_eq!(stored.open_balance_minor, 0);
    }

    #[tokio::test]
    async fn test_older_copy_on_later_page_is_skipped() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(InvoicePage {
                records: vec![SourceRecord::Invoice(invoice("INV-1", at(10), 0))],
                has_more: true,
            }),
            Ok(InvoicePage {
                records: vec![SourceRecord::Invoice(invoice("INV-1", at(9), 999))],
                has_more: false,
            }),
        ]));
        let h = harness(source, None).await;

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!((report.created, report.updated, report.unchanged), (1, 0, 1));

        let stored = InvoiceRepository::new(h.db.clone())
            .find_by_external_id(h.connection_id, "INV-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.source_last_modified, at(10));
        assert_eq!(stored.open_balance_minor, 0);
    }

    #[tokio::test]
    async fn test_record_edited_mid_run_does_not_hide_later_records() {
        let source = Arc::new(FakeQuickBooks::with(vec![
            invoice("A", at(1), 100),
            invoice("B", at(2), 100),
            invoice("C", at(3), 100),
            invoice("D", at(4), 100),
        ]));
        // A is edited upstream after the first page committed.
        source.edit_before_request(1, invoice("A", at(10), 50));
        let h = harness(source.clone(), None).await;

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!((report.created, report.updated), (4, 1));
        assert_eq!(report.cursor, Some(at(10)));

        let queries = source.queries.lock().unwrap().clone();
        assert_eq!(queries[1].modified_since, Some(at(2)));
        assert_eq!(queries[1].skip, 1);

        let invoices = InvoiceRepository::new(h.db.clone());
        for id in ["A", "B", "C", "D"] {
            assert!(
                invoices
                    .find_by_external_id(h.connection_id, id)
                    .await
                    .unwrap()
                    .is_some(),
                "invoice {} missing",
                id
            );
        }
        let a = invoices
            .find_by_external_id(h.connection_id, "A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.open_balance_minor, 50);
    }

    #[test]
    fn test_next_skip_counts_records_at_new_cursor() {
        let query = PageQuery {
            modified_since: Some(at(1)),
            skip: 0,
            page_size: 4,
        };
        let stamps = [Some(at(1)), Some(at(3)), Some(at(3)), None];
        assert_eq!(next_skip(&query, &stamps, Some(at(3))), 3);

        // Cursor did not move: the whole page lies ahead of the same start.
        let same = [Some(at(1)), Some(at(1)), None, Some(at(1))];
        let query = PageQuery { skip: 4, ..query };
        assert_eq!(next_skip(&query, &same, Some(at(1))), 8);
    }

    #[tokio::test]
    async fn test_malformed_records_are_counted_and_listed() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(InvoicePage {
            records: vec![
                SourceRecord::Invoice(invoice("1", at(1), 100)),
                SourceRecord::Malformed {
                    external_id: Some("2".into()),
                    reason: "missing CustomerRef".into(),
                },
                SourceRecord::Malformed {
                    external_id: None,
                    reason: "missing Id".into(),
                },
            ],
            has_more: false,
        })]));
        let h = harness(source, None).await;

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].external_id.as_deref(), Some("2"));
        assert_eq!(report.cursor, Some(at(1)));
    }

    #[tokio::test]
    async fn test_unauthorized_triggers_single_refresh() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "token_type": "bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = Arc::new(ScriptedSource::new(vec![
            Err(QuickBooksError::Unauthorized {
                body: "AuthenticationFailed".into(),
            }),
            Ok(InvoicePage {
                records: vec![SourceRecord::Invoice(invoice("1", at(1), 100))],
                has_more: false,
            }),
        ]));
        let h = harness(source.clone(), Some(format!("{}/token", server.uri()))).await;

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(
            *source.tokens_seen.lock().unwrap(),
            vec!["access-0".to_string(), "access-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_second_unauthorized_requires_reauthorization() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "token_type": "bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let unauthorized = || {
            Err(QuickBooksError::Unauthorized {
                body: "AuthenticationFailed".into(),
            })
        };
        let source = Arc::new(ScriptedSource::new(vec![unauthorized(), unauthorized()]));
        let h = harness(source, Some(format!("{}/token", server.uri()))).await;

        let err = h.executor.sync(h.connection_id).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Authorization(OAuthError::ReauthorizationRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_source_completes_without_cursor() {
        let source = Arc::new(FakeQuickBooks::default());
        let h = harness(source, None).await;

        let report = h.executor.sync(h.connection_id).await.unwrap();
        assert_eq!(report, SyncReport { pages: 1, ..SyncReport::default() });
    }
}
