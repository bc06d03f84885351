//! Shared-state adapters: the fixed-window rate limiter and its counter store, plus
//! the opportunity catalog store.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fellows_core::{Category, Opportunity, OpportunityDate, PipelineError};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "fellows-storage";

/// Every five minutes, on the minute.
pub const DEFAULT_SWEEP_CRON: &str = "0 */5 * * * *";

/// What the limiter does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    FailOpen,
    FailClosed,
}

impl FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_open" | "open" => Ok(StoreFailurePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(StoreFailurePolicy::FailClosed),
            other => Err(format!("unknown rate limit failure policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
    pub on_store_failure: StoreFailurePolicy,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            on_store_failure: StoreFailurePolicy::FailClosed,
        }
    }
}

impl RateLimitPolicy {
    fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }

    pub fn window_elapsed(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - window_start > self.window_chrono()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    pub window: RateLimitWindow,
    pub admitted: bool,
}

/// The fixed-window rule, shared by every counter store implementation.
pub fn advance_window(
    previous: Option<RateLimitWindow>,
    now: DateTime<Utc>,
    policy: &RateLimitPolicy,
) -> WindowHit {
    match previous {
        Some(prev) if !policy.window_elapsed(prev.window_start, now) => {
            if prev.count < policy.max_requests {
                WindowHit {
                    window: RateLimitWindow {
                        count: prev.count + 1,
                        window_start: prev.window_start,
                    },
                    admitted: true,
                }
            } else {
                WindowHit {
                    window: prev,
                    admitted: false,
                }
            }
        }
        _ => WindowHit {
            window: RateLimitWindow {
                count: 1,
                window_start: now,
            },
            admitted: true,
        },
    }
}

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for CounterStoreError {
    fn from(err: sqlx::Error) -> Self {
        CounterStoreError::Unavailable(err.to_string())
    }
}

/// Shared key/value counter capability. `hit` must be a single atomic
/// read-modify-write per key, and entries expire one window after `window_start`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        policy: &RateLimitPolicy,
    ) -> Result<WindowHit, CounterStoreError>;

    /// Drop windows whose time-to-live has passed; returns how many went.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, CounterStoreError>;
}

#[derive(Debug, Clone, Copy)]
struct StoredWindow {
    window: RateLimitWindow,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, StoredWindow>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        policy: &RateLimitPolicy,
    ) -> Result<WindowHit, CounterStoreError> {
        let mut entries = self.entries.lock().await;
        // Expired entries read as absent; the insert below replaces them.
        let previous = entries
            .get(key)
            .filter(|stored| stored.expires_at >= now)
            .map(|stored| stored.window);
        let hit = advance_window(previous, now, policy);
        entries.insert(
            key.to_string(),
            StoredWindow {
                window: hit.window,
                expires_at: hit.window.window_start + policy.window_chrono(),
            },
        );
        Ok(hit)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, stored| stored.expires_at >= now);
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn hit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        policy: &RateLimitPolicy,
    ) -> Result<WindowHit, CounterStoreError> {
        // SET expressions all read the pre-update row, so `admitted` reflects the old count.
        let row = sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (identity, count, window_start, expires_at, admitted)
            VALUES ($1, 1, $2, $2 + make_interval(secs => $3), TRUE)
            ON CONFLICT (identity) DO UPDATE SET
                count = CASE
                    WHEN $2 - rate_limit_windows.window_start > make_interval(secs => $3) THEN 1
                    WHEN rate_limit_windows.count < $4 THEN rate_limit_windows.count + 1
                    ELSE rate_limit_windows.count
                END,
                admitted = ($2 - rate_limit_windows.window_start > make_interval(secs => $3))
                    OR rate_limit_windows.count < $4,
                window_start = CASE
                    WHEN $2 - rate_limit_windows.window_start > make_interval(secs => $3) THEN $2
                    ELSE rate_limit_windows.window_start
                END,
                expires_at = CASE
                    WHEN $2 - rate_limit_windows.window_start > make_interval(secs => $3)
                        THEN $2 + make_interval(secs => $3)
                    ELSE rate_limit_windows.expires_at
                END
            RETURNING count, window_start, admitted
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(policy.window.as_secs_f64())
        .bind(i32::try_from(policy.max_requests).unwrap_or(i32::MAX))
        .fetch_one(&self.pool)
        .await?;

        let count: i32 = row.try_get("count")?;
        Ok(WindowHit {
            window: RateLimitWindow {
                count: u32::try_from(count).unwrap_or(0),
                window_start: row.try_get("window_start")?,
            },
            admitted: row.try_get("admitted")?,
        })
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSchedule {
    pub enabled: bool,
    pub cron: String,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: DEFAULT_SWEEP_CRON.to_string(),
        }
    }
}

pub async fn sweep_counters(store: &dyn CounterStore, now: DateTime<Utc>) -> u64 {
    match store.sweep_expired(now).await {
        Ok(removed) => {
            debug!(removed, "swept expired rate limit windows");
            removed
        }
        Err(err) => {
            warn!(error = %err, "rate limit sweep failed");
            0
        }
    }
}

/// Background expiry for the counter store. The caller starts the returned scheduler.
pub async fn maybe_build_sweeper(
    store: Arc<dyn CounterStore>,
    schedule: &SweepSchedule,
) -> anyhow::Result<Option<JobScheduler>> {
    if !schedule.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating counter sweep scheduler")?;
    let job = Job::new_async(schedule.cron.as_str(), move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            sweep_counters(store.as_ref(), Utc::now()).await;
        })
    })
    .with_context(|| format!("creating counter sweep job for cron {}", schedule.cron))?;
    sched.add(job).await.context("adding counter sweep job")?;
    Ok(Some(sched))
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn store(&self) -> Arc<dyn CounterStore> {
        self.store.clone()
    }

    pub fn counter_key(identity: &str) -> String {
        format!("ratelimit:{identity}")
    }

    /// Returns `true` when the caller is limited and must be rejected.
    pub async fn check_and_consume(&self, identity: &str) -> bool {
        self.check_and_consume_at(identity, Utc::now()).await
    }

    pub async fn check_and_consume_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let key = Self::counter_key(identity);
        match self.store.hit(&key, now, &self.policy).await {
            Ok(hit) if hit.admitted => false,
            Ok(hit) => {
                info!(identity, count = hit.window.count, "rate limit exceeded");
                true
            }
            Err(err) => {
                let limited = self.policy.on_store_failure == StoreFailurePolicy::FailClosed;
                warn!(identity, error = %err, limited, "counter store unreachable; applying failure policy");
                limited
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("opportunity id `{0}` already exists")]
    DuplicateId(String),
    #[error("catalog record `{id}` is invalid: {message}")]
    InvalidRecord { id: String, message: String },
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        CatalogError::Unavailable(err.to_string())
    }
}

impl From<CatalogError> for PipelineError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::DuplicateId(_) => PipelineError::Validation(err.to_string()),
            other => PipelineError::UpstreamFailure(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Opportunity>, CatalogError>;
    async fn get(&self, id: &str) -> Result<Option<Opportunity>, CatalogError>;
    async fn exists(&self, id: &str) -> Result<bool, CatalogError>;
    async fn insert(&self, opportunity: &Opportunity) -> Result<(), CatalogError>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: Mutex<Vec<Opportunity>>,
}

impl MemoryCatalog {
    pub fn new(records: Vec<Opportunity>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn list(&self) -> Result<Vec<Opportunity>, CatalogError> {
        Ok(self.records.lock().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Opportunity>, CatalogError> {
        Ok(self.records.lock().await.iter().find(|o| o.id == id).cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool, CatalogError> {
        Ok(self.records.lock().await.iter().any(|o| o.id == id))
    }

    async fn insert(&self, opportunity: &Opportunity) -> Result<(), CatalogError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|o| o.id == opportunity.id) {
            return Err(CatalogError::DuplicateId(opportunity.id.clone()));
        }
        records.push(opportunity.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const OPPORTUNITY_COLUMNS: &str = "id, name, organizer, description, full_description, open_date, \
     close_date, category, region, country, eligibility, apply_link, tags, benefits";

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, CatalogError> {
    let id: String = row.try_get("id")?;
    let invalid = |message: String| CatalogError::InvalidRecord {
        id: id.clone(),
        message,
    };
    let category: String = row.try_get("category")?;
    let category = Category::from_str(&category).map_err(|e| invalid(e.to_string()))?;
    let date = |column: &str| -> Result<Option<OpportunityDate>, CatalogError> {
        let raw: Option<String> = row.try_get(column)?;
        match raw {
            None => Ok(None),
            Some(raw) => OpportunityDate::parse(&raw)
                .map(Some)
                .ok_or_else(|| invalid(format!("bad {column} `{raw}`"))),
        }
    };
    let strings = |column: &str| -> Result<Vec<String>, CatalogError> {
        let value: serde_json::Value = row.try_get(column)?;
        serde_json::from_value(value).map_err(|e| invalid(format!("bad {column}: {e}")))
    };
    Ok(Opportunity {
        name: row.try_get("name")?,
        organizer: row.try_get("organizer")?,
        description: row.try_get("description")?,
        full_description: row.try_get("full_description")?,
        open_date: date("open_date")?,
        close_date: date("close_date")?,
        category,
        region: row.try_get("region")?,
        country: row.try_get("country")?,
        eligibility: row.try_get("eligibility")?,
        apply_link: row.try_get("apply_link")?,
        tags: strings("tags")?,
        benefits: strings("benefits")?,
        id,
    })
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn list(&self) -> Result<Vec<Opportunity>, CatalogError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<Opportunity>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(opportunity_from_row).transpose()
    }

    async fn exists(&self, id: &str) -> Result<bool, CatalogError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM opportunities WHERE id = $1) AS present")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert(&self, opportunity: &Opportunity) -> Result<(), CatalogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO opportunities
                (id, name, organizer, description, full_description, open_date, close_date,
                 category, region, country, eligibility, apply_link, tags, benefits)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&opportunity.id)
        .bind(&opportunity.name)
        .bind(&opportunity.organizer)
        .bind(&opportunity.description)
        .bind(&opportunity.full_description)
        .bind(opportunity.open_date.map(|d| d.to_string()))
        .bind(opportunity.close_date.map(|d| d.to_string()))
        .bind(opportunity.category.as_str())
        .bind(&opportunity.region)
        .bind(&opportunity.country)
        .bind(&opportunity.eligibility)
        .bind(&opportunity.apply_link)
        .bind(serde_json::json!(opportunity.tags))
        .bind(serde_json::json!(opportunity.benefits))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::DuplicateId(opportunity.id.clone()));
        }
        Ok(())
    }
}

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    use anyhow::Context;

    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    use anyhow::Context;

    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running database migrations")?;
    Ok(())
}
