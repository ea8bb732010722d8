//! Staged batch artifacts + rate-limited HTTP plumbing for the feed pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, StatusCode};
use retl_core::{Batch, CanonicalRecord, StagedArtifactRef};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "retl-storage";

const ARTIFACT_STEM: &str = "reddit_posts";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("encoding batch as csv: {0}")]
    Encode(#[source] csv::Error),
    #[error("decoding staged artifact {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("staged artifact {} does not exist", .path.display())]
    Missing { path: PathBuf },
    #[error("staged artifact {} is outside the staging root", .path.display())]
    OutsideRoot { path: PathBuf },
    #[error(
        "staged artifact {} hash mismatch: expected {expected}, found {actual}",
        .path.display()
    )]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("staged artifact {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl StagingError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable, run-scoped CSV artifacts handed from the fetch unit to the load unit.
#[derive(Debug, Clone)]
pub struct StagingSink {
    root: PathBuf,
}

impl StagingSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(&self, run_id: Uuid, content_hash: &str) -> PathBuf {
        PathBuf::from(run_id.to_string()).join(format!("{ARTIFACT_STEM}-{content_hash}.csv"))
    }

    /// Header row first, then one row per record. Empty batches still get the header.
    pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, StagingError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .write_record(CanonicalRecord::COLUMNS)
            .map_err(StagingError::Encode)?;
        for record in batch.iter() {
            writer.serialize(record).map_err(StagingError::Encode)?;
        }
        writer
            .into_inner()
            .map_err(|e| StagingError::Encode(csv::Error::from(e.into_error())))
    }

    pub fn decode_batch(path: &Path, bytes: &[u8]) -> Result<Batch, StagingError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes);
        let headers = reader.headers().map_err(|source| StagingError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        if !headers.iter().eq(CanonicalRecord::COLUMNS.iter().copied()) {
            return Err(StagingError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("unexpected header row {headers:?}"),
            });
        }

        let mut records = Vec::new();
        for row in reader.deserialize::<CanonicalRecord>() {
            records.push(row.map_err(|source| StagingError::Decode {
                path: path.to_path_buf(),
                source,
            })?);
        }
        let (batch, dropped) = Batch::dedup_keep_first(records);
        if dropped > 0 {
            return Err(StagingError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("{dropped} rows repeat an id"),
            });
        }
        Ok(batch)
    }

    /// Write the batch with a hash-addressed path and atomic temp-file rename.
    /// Either a complete artifact exists at the returned path or nothing does.
    pub async fn stage(
        &self,
        run_id: Uuid,
        batch: &Batch,
    ) -> Result<StagedArtifactRef, StagingError> {
        let bytes = Self::encode_batch(batch)?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.artifact_relative_path(run_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let artifact = StagedArtifactRef {
            run_id,
            path: absolute_path.clone(),
            content_hash,
            record_count: batch.len(),
            byte_size: bytes.len(),
        };

        let run_dir = self.root.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| StagingError::io("creating staging directory", &run_dir, e))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(|e| StagingError::io("checking artifact path", &absolute_path, e))?
        {
            debug!(path = %absolute_path.display(), "identical artifact already staged");
            return Ok(artifact);
        }

        let temp_path = run_dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(err) = write_temp_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => {
                info!(
                    path = %absolute_path.display(),
                    records = artifact.record_count,
                    bytes = artifact.byte_size,
                    "staged batch"
                );
                Ok(artifact)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StagingError::Io {
                    action: "renaming temp artifact into place",
                    path: absolute_path,
                    source: err,
                })
            }
        }
    }

    pub async fn load(&self, artifact: &StagedArtifactRef) -> Result<Batch, StagingError> {
        let path = artifact.path.as_path();
        if !path.starts_with(&self.root) {
            return Err(StagingError::OutsideRoot {
                path: path.to_path_buf(),
            });
        }

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StagingError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(err) => return Err(StagingError::io("reading staged artifact", path, err)),
        };

        let actual = Self::sha256_hex(&bytes);
        if actual != artifact.content_hash {
            return Err(StagingError::HashMismatch {
                path: path.to_path_buf(),
                expected: artifact.content_hash.clone(),
                actual,
            });
        }

        let batch = Self::decode_batch(path, &bytes)?;
        if batch.len() != artifact.record_count {
            return Err(StagingError::Corrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "expected {} records, found {}",
                    artifact.record_count,
                    batch.len()
                ),
            });
        }
        Ok(batch)
    }

    /// Remove everything staged for the artifact's run.
    pub async fn discard(&self, artifact: &StagedArtifactRef) -> Result<(), StagingError> {
        let run_dir = self.root.join(artifact.run_id.to_string());
        match fs::remove_dir_all(&run_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StagingError::io("removing staging directory", &run_dir, err)),
        }
    }
}

async fn write_temp_file(temp_path: &Path, bytes: &[u8]) -> Result<(), StagingError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| StagingError::io("opening temp artifact file", temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StagingError::io("writing temp artifact file", temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StagingError::io("flushing temp artifact file", temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StagingError::io("syncing temp artifact file", temp_path, e))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that allows a burst of `requests` and refills one token every
    /// `60s / requests`.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET with an optional `Authorization` header value and query parameters.
    /// 429/5xx and connection failures are retried per the backoff policy.
    pub async fn get(
        &self,
        run_id: Uuid,
        url: &str,
        authorization: Option<&str>,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", %run_id, url);
        self.send_with_retry(
            || {
                let mut request = self.client.get(url).query(query);
                if let Some(value) = authorization {
                    request = request.header(AUTHORIZATION, value);
                }
                request
            },
            self.backoff.max_retries,
        )
        .instrument(span)
        .await
    }

    /// Form POST with HTTP Basic auth. Never retried: the caller owns that decision.
    pub async fn post_form(
        &self,
        run_id: Uuid,
        url: &str,
        basic_auth: (&str, &str),
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post_form", %run_id, url);
        let (user, password) = basic_auth;
        self.send_with_retry(
            || {
                self.client
                    .post(url)
                    .basic_auth(user, Some(password))
                    .form(form)
            },
            0,
        )
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(
        &self,
        build: F,
        max_retries: usize,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < max_retries {
                        warn!(attempt, status = status.as_u16(), "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < max_retries {
                        warn!(attempt, error = %err, "retryable request failure");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
