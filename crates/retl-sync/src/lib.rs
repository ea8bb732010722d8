//! Pipeline orchestration: fetch unit, load stage, retry policy and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retl_adapters::{
    AuthError, FeedSource, PageFetcher, PageLimits, PasswordGrantTokenProvider, RedditCredentials,
    RedditFeed, TokenProvider, TransportError, DEFAULT_API_BASE, DEFAULT_AUTH_URL,
    DEFAULT_SOURCE_PATH,
};
use retl_core::{CanonicalRecord, StagedArtifactRef};
use retl_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, StagingError, StagingSink, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "retl-sync";

pub const POSTS_TABLE: &str = "reddit_posts";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub auth_url: String,
    pub api_base: String,
    pub source_path: String,
    pub page_size: u32,
    pub max_pages: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub requests_per_minute: u32,
    pub database_url: String,
    pub store_timeout_secs: u64,
    pub staging_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub keep_artifacts: bool,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            client_id: env_or("REDDIT_CLIENT_ID", ""),
            client_secret: env_or("REDDIT_CLIENT_SECRET", ""),
            username: env_or("REDDIT_USERNAME", ""),
            password: env_or("REDDIT_PASSWORD", ""),
            auth_url: env_or("RETL_AUTH_URL", DEFAULT_AUTH_URL),
            api_base: env_or("RETL_API_BASE", DEFAULT_API_BASE),
            source_path: env_or("RETL_SOURCE_PATH", DEFAULT_SOURCE_PATH),
            page_size: env_parse("RETL_PAGE_SIZE", 100),
            max_pages: env_parse("RETL_MAX_PAGES", 10),
            user_agent: env_or("RETL_USER_AGENT", "retl-bot/0.1"),
            http_timeout_secs: env_parse("RETL_HTTP_TIMEOUT_SECS", 20),
            http_max_retries: env_parse("RETL_HTTP_MAX_RETRIES", 2),
            requests_per_minute: env_parse("RETL_REQUESTS_PER_MINUTE", 60),
            database_url: env_or("DATABASE_URL", "sqlite://reddit_etl.db?mode=rwc"),
            store_timeout_secs: env_parse("RETL_STORE_TIMEOUT_SECS", 10),
            staging_dir: PathBuf::from(env_or("RETL_STAGING_DIR", "./staging")),
            reports_dir: PathBuf::from(env_or("RETL_REPORTS_DIR", "./reports")),
            keep_artifacts: env_flag("RETL_KEEP_ARTIFACTS"),
            retries: env_parse("RETL_RETRIES", 1),
            retry_delay_secs: env_parse("RETL_RETRY_DELAY_SECS", 120),
            scheduler_enabled: env_flag("RETL_SCHEDULER_ENABLED"),
            schedule_cron: env_or("RETL_SCHEDULE_CRON", "0 0 6 * * *"),
        }
    }

    /// Credentials for the identity endpoint; every field must be set.
    pub fn credentials(&self) -> Result<RedditCredentials> {
        for (key, value) in [
            ("REDDIT_CLIENT_ID", &self.client_id),
            ("REDDIT_CLIENT_SECRET", &self.client_secret),
            ("REDDIT_USERNAME", &self.username),
            ("REDDIT_PASSWORD", &self.password),
        ] {
            if value.trim().is_empty() {
                bail!("{key} is not set");
            }
        }
        Ok(RedditCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            source_path: self.source_path.clone(),
            limits: PageLimits {
                page_size: self.page_size,
                max_pages: self.max_pages,
            },
            retry: RetryPolicy {
                retries: self.retries,
                delay: Duration::from_secs(self.retry_delay_secs),
            },
            keep_artifacts: self.keep_artifacts,
            reports_dir: Some(self.reports_dir.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreUnavailableError {
    #[error("connecting to {scheme} store: {source}")]
    Connect {
        scheme: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported database url scheme {0:?} (expected sqlite: or postgres:)")]
    UnsupportedUrl(String),
}

/// Append-only sink for canonical records keyed by `id`.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreUnavailableError>;

    /// Returns `false` when a row with the same `id` already exists.
    async fn insert_if_absent(
        &self,
        record: &CanonicalRecord,
    ) -> Result<bool, StoreUnavailableError>;

    async fn count(&self) -> Result<u64, StoreUnavailableError>;
}

fn url_scheme(url: &str) -> String {
    url.split(':').next().unwrap_or_default().to_string()
}

/// Connects eagerly; used where the store is the only thing the caller needs.
pub async fn connect_post_store(
    database_url: &str,
) -> Result<Arc<dyn PostStore>, StoreUnavailableError> {
    let scheme = url_scheme(database_url);
    match scheme.as_str() {
        "sqlite" => Ok(Arc::new(SqlitePostStore::connect(database_url).await?)),
        "postgres" | "postgresql" => Ok(Arc::new(PgPostStore::connect(database_url).await?)),
        _ => Err(StoreUnavailableError::UnsupportedUrl(scheme)),
    }
}

/// Parses the url without opening a connection. Connection failures surface on the
/// first store call, inside the load unit.
pub fn lazy_post_store(
    database_url: &str,
    acquire_timeout: Duration,
) -> Result<Arc<dyn PostStore>, StoreUnavailableError> {
    let scheme = url_scheme(database_url);
    match scheme.as_str() {
        "sqlite" => Ok(Arc::new(SqlitePostStore::connect_lazy(
            database_url,
            acquire_timeout,
        )?)),
        "postgres" | "postgresql" => Ok(Arc::new(PgPostStore::connect_lazy(
            database_url,
            acquire_timeout,
        )?)),
        _ => Err(StoreUnavailableError::UnsupportedUrl(scheme)),
    }
}

pub struct SqlitePostStore {
    pool: SqlitePool,
}

impl SqlitePostStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreUnavailableError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|source| StoreUnavailableError::Connect {
                scheme: "sqlite".into(),
                source,
            })?;
        Ok(Self { pool })
    }

    pub fn connect_lazy(
        database_url: &str,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreUnavailableError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|source| StoreUnavailableError::Connect {
                scheme: "sqlite".into(),
                source,
            })?;
        Ok(Self { pool })
    }

    /// Single pinned connection: every in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreUnavailableError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|source| StoreUnavailableError::Connect {
                scheme: "sqlite".into(),
                source,
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PostStore for SqlitePostStore {
    async fn ensure_schema(&self) -> Result<(), StoreUnavailableError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reddit_posts (
                subreddit TEXT NOT NULL,
                title TEXT NOT NULL,
                selftext TEXT NOT NULL,
                upvote_ratio REAL NOT NULL,
                ups INTEGER NOT NULL,
                downs INTEGER NOT NULL,
                score INTEGER NOT NULL,
                created_utc TEXT NOT NULL,
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        record: &CanonicalRecord,
    ) -> Result<bool, StoreUnavailableError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reddit_posts
                (subreddit, title, selftext, upvote_ratio, ups, downs, score, created_utc, id, kind)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.subreddit)
        .bind(&record.title)
        .bind(&record.selftext)
        .bind(record.upvote_ratio)
        .bind(record.ups)
        .bind(record.downs)
        .bind(record.score)
        .bind(record.created_utc_string())
        .bind(&record.id)
        .bind(&record.kind)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count(&self) -> Result<u64, StoreUnavailableError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reddit_posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreUnavailableError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|source| StoreUnavailableError::Connect {
                scheme: "postgres".into(),
                source,
            })?;
        Ok(Self { pool })
    }

    pub fn connect_lazy(
        database_url: &str,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreUnavailableError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|source| StoreUnavailableError::Connect {
                scheme: "postgres".into(),
                source,
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn ensure_schema(&self) -> Result<(), StoreUnavailableError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reddit_posts (
                subreddit TEXT NOT NULL,
                title TEXT NOT NULL,
                selftext TEXT NOT NULL,
                upvote_ratio DOUBLE PRECISION NOT NULL,
                ups BIGINT NOT NULL,
                downs BIGINT NOT NULL,
                score BIGINT NOT NULL,
                created_utc TIMESTAMPTZ NOT NULL,
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        record: &CanonicalRecord,
    ) -> Result<bool, StoreUnavailableError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reddit_posts
                (subreddit, title, selftext, upvote_ratio, ups, downs, score, created_utc, id, kind)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.subreddit)
        .bind(&record.title)
        .bind(&record.selftext)
        .bind(record.upvote_ratio)
        .bind(record.ups)
        .bind(record.downs)
        .bind(record.score)
        .bind(record.created_utc)
        .bind(&record.id)
        .bind(&record.kind)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count(&self) -> Result<u64, StoreUnavailableError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reddit_posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    StoreUnavailable(#[from] StoreUnavailableError),
    #[error("run {run_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunState,
        to: RunState,
    },
    #[error("run {run_id} has no staged artifact to load")]
    MissingArtifact { run_id: Uuid },
    #[error("artifact from run {artifact_run} cannot be loaded by run {run_id}")]
    ForeignArtifact { run_id: Uuid, artifact_run: Uuid },
    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(_) | Self::StoreUnavailable(_) => true,
            Self::Transport(TransportError::Cancelled { .. }) => false,
            Self::Transport(_) => true,
            Self::Staging(_)
            | Self::InvalidTransition { .. }
            | Self::MissingArtifact { .. }
            | Self::ForeignArtifact { .. }
            | Self::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    FetchPending,
    FetchDone,
    LoadPending,
    LoadDone,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub pages: usize,
    pub records: usize,
    pub duplicates_dropped: usize,
    pub malformed_records: usize,
    pub final_cursor: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// One scheduled run. Owns the handoff reference between its fetch and load units.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    state: RunState,
    fetch_attempts: u32,
    load_attempts: u32,
    artifact: Option<StagedArtifactRef>,
    fetch_stats: Option<FetchStats>,
    load_report: Option<LoadReport>,
    last_error: Option<String>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: RunState::FetchPending,
            fetch_attempts: 0,
            load_attempts: 0,
            artifact: None,
            fetch_stats: None,
            load_report: None,
            last_error: None,
        }
    }

    /// Rebuild run `run_id` whose fetch unit completed elsewhere (e.g. a separate
    /// process) from the handoff reference it published. A reference published by a
    /// different run is accepted here and refused by the load unit.
    pub fn resume_after_fetch(run_id: Uuid, artifact: StagedArtifactRef) -> Self {
        Self {
            run_id,
            state: RunState::FetchDone,
            artifact: Some(artifact),
            ..Self::new()
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn artifact(&self) -> Option<&StagedArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn fetch_attempts(&self) -> u32 {
        self.fetch_attempts
    }

    pub fn load_attempts(&self) -> u32 {
        self.load_attempts
    }

    fn transition(&mut self, expected: RunState, to: RunState) -> Result<(), PipelineError> {
        if self.state != expected {
            return Err(PipelineError::InvalidTransition {
                run_id: self.run_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub source_path: String,
    pub limits: PageLimits,
    pub retry: RetryPolicy,
    pub keep_artifacts: bool,
    pub reports_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            source_path: DEFAULT_SOURCE_PATH.to_string(),
            limits: PageLimits::default(),
            retry: RetryPolicy::default(),
            keep_artifacts: false,
            reports_dir: None,
        }
    }
}

/// Reads a staged batch and appends it to the store, skipping existing ids.
pub struct LoadStage {
    staging: StagingSink,
    store: Arc<dyn PostStore>,
    call_timeout: Duration,
}

impl LoadStage {
    pub fn new(staging: StagingSink, store: Arc<dyn PostStore>, call_timeout: Duration) -> Self {
        Self {
            staging,
            store,
            call_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreUnavailableError>
    where
        F: std::future::Future<Output = Result<T, StoreUnavailableError>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| StoreUnavailableError::Timeout(self.call_timeout))?
    }

    /// Safe to repeat: rows already present are counted as skipped.
    pub async fn load_batch(
        &self,
        artifact: &StagedArtifactRef,
        cancel: &CancellationToken,
    ) -> Result<LoadReport, PipelineError> {
        let batch = self.staging.load(artifact).await?;
        if batch.is_empty() {
            debug!("staged batch is empty; nothing to load");
            return Ok(LoadReport::default());
        }

        self.bounded(self.store.ensure_schema()).await?;

        let mut report = LoadReport::default();
        for record in batch.iter() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.bounded(self.store.insert_if_absent(record)).await? {
                report.inserted += 1;
            } else {
                report.skipped += 1;
            }
        }
        info!(
            inserted = report.inserted,
            skipped = report.skipped,
            table = POSTS_TABLE,
            "batch loaded"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub fetch_attempts: u32,
    pub load_attempts: u32,
    pub fetch: Option<FetchStats>,
    pub load: Option<LoadReport>,
    pub artifact: Option<StagedArtifactRef>,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn from_run(run: &PipelineRun, finished_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run.run_id,
            started_at: run.started_at,
            finished_at,
            state: run.state,
            fetch_attempts: run.fetch_attempts,
            load_attempts: run.load_attempts,
            fetch: run.fetch_stats.clone(),
            load: run.load_report,
            artifact: run.artifact.clone(),
            error: run.last_error.clone(),
        }
    }
}

/// Sequences fetch → stage → load for one run at a time. Built per run.
pub struct PipelineOrchestrator {
    token_provider: Arc<dyn TokenProvider>,
    page_fetcher: PageFetcher,
    staging: StagingSink,
    load_stage: LoadStage,
    settings: OrchestratorSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        token_provider: Arc<dyn TokenProvider>,
        feed: Arc<dyn FeedSource>,
        staging: StagingSink,
        store: Arc<dyn PostStore>,
        store_timeout: Duration,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            token_provider,
            page_fetcher: PageFetcher::new(feed),
            load_stage: LoadStage::new(staging.clone(), store, store_timeout),
            staging,
            settings,
        }
    }

    /// Wire the production collaborators. Credentials are checked at authentication
    /// and the store is first contacted by the load unit.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..BackoffPolicy::default()
            },
            token_bucket: (config.requests_per_minute > 0)
                .then(|| TokenBucketConfig::per_minute(config.requests_per_minute)),
        })?);
        let credentials = RedditCredentials {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };
        let token_provider = Arc::new(PasswordGrantTokenProvider::new(
            http.clone(),
            config.auth_url.clone(),
            credentials,
        ));
        let feed = Arc::new(RedditFeed::new(http, config.api_base.clone()));
        let store_timeout = Duration::from_secs(config.store_timeout_secs);
        let store = lazy_post_store(&config.database_url, store_timeout)
            .context("configuring target store")?;

        Ok(Self::new(
            token_provider,
            feed,
            StagingSink::new(config.staging_dir.clone()),
            store,
            store_timeout,
            config.settings(),
        ))
    }

    pub fn load_stage(&self) -> &LoadStage {
        &self.load_stage
    }

    async fn fetch_attempt(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(StagedArtifactRef, FetchStats), PipelineError> {
        let credential = self.token_provider.authenticate(run_id).await?;
        let outcome = self
            .page_fetcher
            .fetch_pages(
                run_id,
                &credential,
                &self.settings.source_path,
                self.settings.limits,
                cancel,
            )
            .await?;
        let artifact = self.staging.stage(run_id, &outcome.batch).await?;
        let stats = FetchStats {
            pages: outcome.pages,
            records: outcome.batch.len(),
            duplicates_dropped: outcome.duplicates_dropped,
            malformed_records: outcome.rejected.len(),
            final_cursor: outcome.cursor.to_string(),
        };
        Ok((artifact, stats))
    }

    /// Wait out the retry delay unless the run is cancelled first.
    async fn retry_pause(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(self.settings.retry.delay) => Ok(()),
        }
    }

    /// `FETCH_PENDING → FETCH_DONE`, retried from `FETCH_PENDING` within the budget.
    pub async fn fetch(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<StagedArtifactRef, PipelineError> {
        if run.state != RunState::FetchPending {
            return Err(PipelineError::InvalidTransition {
                run_id: run.run_id,
                from: run.state,
                to: RunState::FetchDone,
            });
        }

        loop {
            run.fetch_attempts += 1;
            let attempt = run.fetch_attempts;
            let span = info_span!("fetch_unit", run_id = %run.run_id, attempt);
            match self.fetch_attempt(run.run_id, cancel).instrument(span).await {
                Ok((artifact, stats)) => {
                    run.transition(RunState::FetchPending, RunState::FetchDone)?;
                    run.artifact = Some(artifact.clone());
                    run.fetch_stats = Some(stats);
                    run.last_error = None;
                    return Ok(artifact);
                }
                Err(err) => {
                    run.state = RunState::Failed;
                    run.last_error = Some(err.to_string());
                    if err.is_retryable() && attempt <= self.settings.retry.retries {
                        warn!(
                            run_id = %run.run_id,
                            attempt,
                            retries = self.settings.retry.retries,
                            delay_secs = self.settings.retry.delay.as_secs(),
                            error = %err,
                            "fetch unit failed, will retry"
                        );
                        self.retry_pause(cancel).await?;
                        run.state = RunState::FetchPending;
                        continue;
                    }
                    error!(run_id = %run.run_id, attempt, error = %err, "fetch unit failed");
                    return Err(err);
                }
            }
        }
    }

    /// `FETCH_DONE → LOAD_PENDING → LOAD_DONE`, using only this run's artifact.
    pub async fn load(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<LoadReport, PipelineError> {
        if run.state != RunState::FetchDone {
            return Err(PipelineError::InvalidTransition {
                run_id: run.run_id,
                from: run.state,
                to: RunState::LoadPending,
            });
        }
        let artifact = run
            .artifact
            .clone()
            .ok_or(PipelineError::MissingArtifact { run_id: run.run_id })?;
        if artifact.run_id != run.run_id {
            return Err(PipelineError::ForeignArtifact {
                run_id: run.run_id,
                artifact_run: artifact.run_id,
            });
        }
        run.transition(RunState::FetchDone, RunState::LoadPending)?;

        loop {
            run.load_attempts += 1;
            let attempt = run.load_attempts;
            let span = info_span!("load_unit", run_id = %run.run_id, attempt);
            match self
                .load_stage
                .load_batch(&artifact, cancel)
                .instrument(span)
                .await
            {
                Ok(report) => {
                    run.transition(RunState::LoadPending, RunState::LoadDone)?;
                    run.load_report = Some(report);
                    run.last_error = None;
                    return Ok(report);
                }
                Err(err) => {
                    run.state = RunState::Failed;
                    run.last_error = Some(err.to_string());
                    if err.is_retryable() && attempt <= self.settings.retry.retries {
                        warn!(
                            run_id = %run.run_id,
                            attempt,
                            retries = self.settings.retry.retries,
                            error = %err,
                            "load unit failed, will retry"
                        );
                        self.retry_pause(cancel).await?;
                        run.state = RunState::LoadPending;
                        continue;
                    }
                    error!(run_id = %run.run_id, attempt, error = %err, "load unit failed");
                    return Err(err);
                }
            }
        }
    }

    /// Full run: fetch, then load as a hard dependency, then report.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunSummary, PipelineError> {
        let mut run = PipelineRun::new();
        let span = info_span!("pipeline_run", run_id = %run.run_id);
        async {
            info!(source_path = %self.settings.source_path, "pipeline run started");
            let result = self.fetch_then_load(&mut run, cancel).await;
            let summary = RunSummary::from_run(&run, Utc::now());
            if let Some(dir) = &self.settings.reports_dir {
                if let Err(err) = write_run_report(dir, &summary).await {
                    warn!(error = %err, "failed to write run report");
                }
            }
            result.map(|()| summary)
        }
        .instrument(span)
        .await
    }

    async fn fetch_then_load(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let artifact = self.fetch(run, cancel).await?;
        self.load(run, cancel).await?;
        if !self.settings.keep_artifacts {
            if let Err(err) = self.staging.discard(&artifact).await {
                warn!(error = %err, "failed to discard staged artifact");
            }
        }
        info!(state = ?run.state, "pipeline run finished");
        Ok(())
    }
}

pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(format!("{}.json", summary.run_id));
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_sync_once(config: &SyncConfig, cancel: &CancellationToken) -> Result<RunSummary> {
    config.credentials()?;
    let orchestrator = PipelineOrchestrator::from_config(config).await?;
    Ok(orchestrator.run_once(cancel).await?)
}

/// Daily recurrence: every trigger builds a fresh orchestrator and runs once.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = Arc::new(config.clone());
    let job = Job::new_async(config.schedule_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_sync_once(&config, &CancellationToken::new()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    state = ?summary.state,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.schedule_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn report_recent_runs_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    entries.reverse();

    let mut lines = vec!["# Reddit ETL Runs".to_string(), String::new()];
    for entry in entries.into_iter().take(runs.max(1)) {
        let path = entry.path();
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- state: {:?}", summary.state));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- attempts: fetch {} / load {}",
            summary.fetch_attempts, summary.load_attempts
        ));
        if let Some(fetch) = &summary.fetch {
            lines.push(format!(
                "- fetched: {} records over {} pages ({} duplicates, {} malformed)",
                fetch.records, fetch.pages, fetch.duplicates_dropped, fetch.malformed_records
            ));
        }
        if let Some(load) = &summary.load {
            lines.push(format!("- loaded: {} inserted, {} skipped", load.inserted, load.skipped));
        }
        if let Some(err) = &summary.error {
            lines.push(format!("- error: {err}"));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
