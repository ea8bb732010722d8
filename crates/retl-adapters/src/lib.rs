//! Reddit feed source: credential acquisition, cursor paging and record normalization.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use retl_core::{
    timestamp_from_epoch, Batch, CanonicalRecord, Credential, Cursor, MalformedRecordError,
};
use retl_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "retl-adapters";

pub const DEFAULT_AUTH_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";
pub const DEFAULT_SOURCE_PATH: &str = "/r/python/new";

/// Used when the identity endpoint omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Upper bound on a server-supplied `expires_in` (one year).
const MAX_TOKEN_TTL_SECS: i64 = 31_536_000;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity request failed: {0}")]
    Request(#[source] FetchError),
    #[error("identity response is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(
        "identity response has no access_token (error: {})",
        .error.as_deref().unwrap_or("none")
    )]
    MissingToken { error: Option<String> },
    #[error("identity response expires_in={expires_in} does not yield a valid expiry")]
    InvalidExpiry { expires_in: i64 },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("feed rejected the credential (401); re-authentication required")]
    Unauthorized,
    #[error("feed request failed: {0}")]
    Http(#[source] FetchError),
    #[error("feed page is not a valid listing: {0}")]
    MalformedBody(#[source] serde_json::Error),
    #[error("credential expired at {0} before the next page request")]
    CredentialExpired(DateTime<Utc>),
    #[error("fetch cancelled after {pages} pages")]
    Cancelled { pages: usize },
}

impl TransportError {
    fn from_fetch(err: FetchError) -> Self {
        if err.status() == Some(401) {
            Self::Unauthorized
        } else {
            Self::Http(err)
        }
    }
}

/// `{kind, data: {...}}` entry of a listing page, kept untyped until normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub kind: JsonValue,
    #[serde(default)]
    pub data: JsonValue,
}

impl RawItem {
    pub fn kind_str(&self) -> Option<&str> {
        self.kind.as_str()
    }

    pub fn id_str(&self) -> Option<&str> {
        self.data.get("id").and_then(JsonValue::as_str)
    }
}

impl From<JsonValue> for RawItem {
    /// Never fails: a child of the wrong shape becomes an item with null fields.
    fn from(child: JsonValue) -> Self {
        match child {
            JsonValue::Object(mut fields) => Self {
                kind: fields.remove("kind").unwrap_or(JsonValue::Null),
                data: fields.remove("data").unwrap_or(JsonValue::Null),
            },
            _ => Self {
                kind: JsonValue::Null,
                data: JsonValue::Null,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<JsonValue>,
}

/// Only the envelope is validated here; each child is checked by the normalizer.
pub fn parse_listing_page(body: &[u8]) -> Result<Vec<RawItem>, TransportError> {
    let page: ListingPage =
        serde_json::from_slice(body).map_err(TransportError::MalformedBody)?;
    Ok(page.data.children.into_iter().map(RawItem::from).collect())
}

#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a fresh bearer credential. Not retried internally.
    async fn authenticate(&self, run_id: Uuid) -> Result<Credential, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth2 password grant against the Reddit identity endpoint.
#[derive(Debug)]
pub struct PasswordGrantTokenProvider {
    http: Arc<HttpFetcher>,
    auth_url: String,
    credentials: RedditCredentials,
}

impl PasswordGrantTokenProvider {
    pub fn new(
        http: Arc<HttpFetcher>,
        auth_url: impl Into<String>,
        credentials: RedditCredentials,
    ) -> Self {
        Self {
            http,
            auth_url: auth_url.into(),
            credentials,
        }
    }
}

#[async_trait]
impl TokenProvider for PasswordGrantTokenProvider {
    async fn authenticate(&self, run_id: Uuid) -> Result<Credential, AuthError> {
        let requested_at = Utc::now();
        let form = [
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ];
        let resp = self
            .http
            .post_form(
                run_id,
                &self.auth_url,
                (&self.credentials.client_id, &self.credentials.client_secret),
                &form,
            )
            .await
            .map_err(AuthError::Request)?;

        let token: TokenResponse = serde_json::from_slice(&resp.body)?;
        let access_token = match token.access_token {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(AuthError::MissingToken { error: token.error }),
        };
        let expires_in = token.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        let expires_at = Duration::try_seconds(expires_in.clamp(0, MAX_TOKEN_TTL_SECS))
            .and_then(|ttl| requested_at.checked_add_signed(ttl))
            .ok_or(AuthError::InvalidExpiry { expires_in })?;
        let credential = Credential::new(access_token, expires_at);
        info!(%run_id, expires_at = %credential.expires_at(), "authenticated against feed api");
        Ok(credential)
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// One page of at most `page_size` items starting after `cursor`.
    async fn fetch_page(
        &self,
        run_id: Uuid,
        credential: &Credential,
        source_path: &str,
        page_size: u32,
        cursor: &Cursor,
    ) -> Result<Vec<RawItem>, TransportError>;
}

#[derive(Debug)]
pub struct RedditFeed {
    http: Arc<HttpFetcher>,
    api_base: String,
}

impl RedditFeed {
    pub fn new(http: Arc<HttpFetcher>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }

    pub fn url_for(&self, source_path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            source_path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl FeedSource for RedditFeed {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        credential: &Credential,
        source_path: &str,
        page_size: u32,
        cursor: &Cursor,
    ) -> Result<Vec<RawItem>, TransportError> {
        let mut query = vec![("limit", page_size.to_string())];
        if let Some(after) = cursor.as_param() {
            query.push(("after", after.to_string()));
        }
        let authorization = credential.authorization_header();
        let resp = self
            .http
            .get(run_id, &self.url_for(source_path), Some(&authorization), &query)
            .await
            .map_err(TransportError::from_fetch)?;
        parse_listing_page(&resp.body)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedItems {
    pub records: Vec<CanonicalRecord>,
    pub rejected: Vec<MalformedRecordError>,
}

/// Maps raw feed items onto [`CanonicalRecord`]s. Bad items are rejected one by one.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordNormalizer;

impl RecordNormalizer {
    pub fn normalize(&self, raw_items: &[RawItem]) -> NormalizedItems {
        self.normalize_from(0, raw_items)
    }

    /// Like [`normalize`](Self::normalize), numbering items from `first_index`.
    pub fn normalize_from(&self, first_index: usize, raw_items: &[RawItem]) -> NormalizedItems {
        let mut out = NormalizedItems::default();
        for (offset, item) in raw_items.iter().enumerate() {
            match normalize_item(first_index + offset, item) {
                Ok(record) => out.records.push(record),
                Err(err) => out.rejected.push(err),
            }
        }
        out
    }
}

struct ItemFields<'a> {
    index: usize,
    id: Option<&'a str>,
    data: &'a JsonValue,
}

impl<'a> ItemFields<'a> {
    fn reject(&self, field: &'static str, reason: impl Into<String>) -> MalformedRecordError {
        MalformedRecordError {
            index: self.index,
            id: self.id.map(ToString::to_string),
            field,
            reason: reason.into(),
        }
    }

    fn present(&self, field: &'static str) -> Result<&'a JsonValue, MalformedRecordError> {
        match self.data.get(field) {
            None | Some(JsonValue::Null) => Err(self.reject(field, "is missing")),
            Some(value) => Ok(value),
        }
    }

    fn string(&self, field: &'static str) -> Result<String, MalformedRecordError> {
        self.present(field)?
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| self.reject(field, "is not a string"))
    }

    fn number(&self, field: &'static str) -> Result<f64, MalformedRecordError> {
        self.present(field)?
            .as_f64()
            .ok_or_else(|| self.reject(field, "is not a number"))
    }

    fn integer(&self, field: &'static str) -> Result<i64, MalformedRecordError> {
        let value = self.present(field)?;
        if let Some(v) = value.as_i64() {
            return Ok(v);
        }
        match value.as_f64() {
            Some(v) if v.fract() == 0.0 && v.is_finite() => Ok(v as i64),
            _ => Err(self.reject(field, "is not an integer")),
        }
    }
}

pub fn normalize_item(
    index: usize,
    item: &RawItem,
) -> Result<CanonicalRecord, MalformedRecordError> {
    let fields = ItemFields {
        index,
        id: item.id_str(),
        data: &item.data,
    };

    let kind = match &item.kind {
        JsonValue::Null => return Err(fields.reject("kind", "is missing")),
        JsonValue::String(kind) => kind.clone(),
        _ => return Err(fields.reject("kind", "is not a string")),
    };
    if !item.data.is_object() {
        return Err(fields.reject("data", "is not an object"));
    }
    let id = fields.string("id")?;

    let upvote_ratio = fields.number("upvote_ratio")?;
    if !(0.0..=1.0).contains(&upvote_ratio) {
        return Err(fields.reject("upvote_ratio", format!("{upvote_ratio} is outside [0, 1]")));
    }

    let created_epoch = fields.number("created_utc")?;
    let created_utc = timestamp_from_epoch(created_epoch).ok_or_else(|| {
        fields.reject("created_utc", format!("{created_epoch} is not a valid epoch"))
    })?;

    Ok(CanonicalRecord {
        subreddit: fields.string("subreddit")?,
        title: fields.string("title")?,
        selftext: fields.string("selftext")?,
        upvote_ratio,
        ups: fields.integer("ups")?,
        downs: fields.integer("downs")?,
        score: fields.integer("score")?,
        created_utc,
        id,
        kind,
    })
}

/// Cursor after the last item on the page that carries both `kind` and `data.id`.
pub fn cursor_after_page(items: &[RawItem]) -> Option<Cursor> {
    items.iter().rev().find_map(|item| {
        Some(Cursor::after_item(item.kind_str()?, item.id_str()?))
    })
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub batch: Batch,
    pub pages: usize,
    pub cursor: Cursor,
    pub duplicates_dropped: usize,
    pub rejected: Vec<MalformedRecordError>,
}

#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub page_size: u32,
    pub max_pages: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10,
        }
    }
}

/// Walks the feed from its head with a moving cursor, bounded by `max_pages`.
pub struct PageFetcher {
    source: Arc<dyn FeedSource>,
    normalizer: RecordNormalizer,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn FeedSource>) -> Self {
        Self {
            source,
            normalizer: RecordNormalizer,
        }
    }

    /// Any transport failure discards everything accumulated so far.
    pub async fn fetch_pages(
        &self,
        run_id: Uuid,
        credential: &Credential,
        source_path: &str,
        limits: PageLimits,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransportError> {
        let span = info_span!("fetch_pages", %run_id, source_path, max_pages = limits.max_pages);
        self.fetch_pages_inner(run_id, credential, source_path, limits, cancel)
            .instrument(span)
            .await
    }

    async fn fetch_pages_inner(
        &self,
        run_id: Uuid,
        credential: &Credential,
        source_path: &str,
        limits: PageLimits,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransportError> {
        let mut cursor = Cursor::start();
        let mut accumulated = Vec::new();
        let mut rejected = Vec::new();
        let mut scanned = 0usize;
        let mut pages = 0usize;

        while pages < limits.max_pages {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled { pages });
            }
            if credential.is_expired_at(Utc::now()) {
                return Err(TransportError::CredentialExpired(credential.expires_at()));
            }

            let items = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled { pages }),
                page = self.source.fetch_page(
                    run_id,
                    credential,
                    source_path,
                    limits.page_size,
                    &cursor,
                ) => page?,
            };
            pages += 1;

            if items.is_empty() {
                debug!(pages, "feed exhausted");
                break;
            }

            let normalized = self.normalizer.normalize_from(scanned, &items);
            scanned += items.len();
            for err in &normalized.rejected {
                warn!(error = %err, "skipping malformed feed item");
            }
            debug!(
                pages,
                items = items.len(),
                records = normalized.records.len(),
                after = %cursor,
                "fetched page"
            );
            accumulated.extend(normalized.records);
            rejected.extend(normalized.rejected);

            match cursor_after_page(&items) {
                Some(next) => cursor = next,
                None => {
                    warn!(pages, "no item on the page carries an id; cursor cannot advance");
                    break;
                }
            }
        }

        let (batch, duplicates_dropped) = Batch::dedup_keep_first(accumulated);
        info!(
            pages,
            records = batch.len(),
            duplicates_dropped,
            malformed = rejected.len(),
            cursor = %cursor,
            "fetch complete"
        );
        Ok(FetchOutcome {
            batch,
            pages,
            cursor,
            duplicates_dropped,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retl_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use wiremock::matchers::{
        body_string_contains, header, method, path, query_param, query_param_is_missing,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn post(id: &str, title: &str) -> JsonValue {
        json!({
            "kind": "t3",
            "data": {
                "subreddit": "Python",
                "title": title,
                "selftext": "",
                "upvote_ratio": 0.9,
                "ups": 10,
                "downs": 0,
                "score": 10,
                "created_utc": 1_700_000_000.0,
                "id": id
            }
        })
    }

    fn raw(value: JsonValue) -> RawItem {
        serde_json::from_value(value).expect("raw item")
    }

    fn listing(children: Vec<JsonValue>) -> JsonValue {
        json!({ "kind": "Listing", "data": { "after": null, "children": children } })
    }

    fn http() -> Arc<HttpFetcher> {
        http_with_timeout(std::time::Duration::from_secs(5))
    }

    fn http_with_timeout(timeout: std::time::Duration) -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout,
                user_agent: Some("retl-test/0.1".into()),
                backoff: BackoffPolicy::none(),
                token_bucket: None,
            })
            .expect("client"),
        )
    }

    fn fresh_credential() -> Credential {
        Credential::new("tok", Utc::now() + Duration::hours(1))
    }

    fn test_credentials() -> RedditCredentials {
        RedditCredentials {
            client_id: "client".into(),
            client_secret: "secret".into(),
            username: "user".into(),
            password: "pass".into(),
        }
    }

    /// In-memory feed that serves pre-built pages and records every cursor it saw.
    struct ScriptedFeed {
        pages: Vec<Vec<RawItem>>,
        repeat_last: bool,
        calls: AtomicUsize,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedFeed {
        fn new(pages: Vec<Vec<RawItem>>, repeat_last: bool) -> Self {
            Self {
                pages,
                repeat_last,
                calls: AtomicUsize::new(0),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn fetch_page(
            &self,
            _run_id: Uuid,
            _credential: &Credential,
            _source_path: &str,
            _page_size: u32,
            cursor: &Cursor,
        ) -> Result<Vec<RawItem>, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.cursors
                .lock()
                .unwrap()
                .push(cursor.as_param().map(ToString::to_string));
            let page = match self.pages.get(call) {
                Some(page) => page.clone(),
                None if self.repeat_last => self.pages.last().cloned().unwrap_or_default(),
                None => Vec::new(),
            };
            Ok(page)
        }
    }

    #[test]
    fn normalizes_all_fields() {
        let record = normalize_item(0, &raw(post("abc", "Hello"))).expect("record");
        assert_eq!(record.id, "abc");
        assert_eq!(record.kind, "t3");
        assert_eq!(record.subreddit, "Python");
        assert_eq!(record.upvote_ratio, 0.9);
        assert_eq!(record.ups, 10);
        assert_eq!(record.created_utc_string(), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn malformed_item_is_skipped_not_fatal() {
        let mut items: Vec<RawItem> =
            (1..=5).map(|i| raw(post(&format!("p{i}"), "t"))).collect();
        items[2].data.as_object_mut().unwrap().remove("title");

        let out = RecordNormalizer.normalize(&items);
        assert_eq!(out.records.len(), 4);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].index, 2);
        assert_eq!(out.rejected[0].field, "title");
        assert_eq!(out.rejected[0].id.as_deref(), Some("p3"));
        assert!(out.records.iter().all(|r| r.id != "p3"));
    }

    #[test]
    fn out_of_range_ratio_and_fractional_counts_are_rejected() {
        let mut bad_ratio = raw(post("r", "t"));
        bad_ratio.data["upvote_ratio"] = json!(1.5);
        assert_eq!(normalize_item(0, &bad_ratio).unwrap_err().field, "upvote_ratio");

        let mut bad_ups = raw(post("u", "t"));
        bad_ups.data["ups"] = json!(1.5);
        assert_eq!(normalize_item(0, &bad_ups).unwrap_err().field, "ups");

        let mut float_ups = raw(post("f", "t"));
        float_ups.data["ups"] = json!(12.0);
        assert_eq!(normalize_item(0, &float_ups).expect("integral float").ups, 12);
    }

    #[test]
    fn cursor_comes_from_last_identifiable_item() {
        let mut tail = raw(post("zz", "t"));
        tail.data.as_object_mut().unwrap().remove("id");
        let items = vec![raw(post("aa", "t")), raw(post("bb", "t")), tail];
        assert_eq!(
            cursor_after_page(&items).and_then(|c| c.as_param().map(ToString::to_string)),
            Some("t3_bb".to_string())
        );
        assert!(cursor_after_page(&[]).is_none());
    }

    #[tokio::test]
    async fn paging_stops_at_max_pages_even_if_feed_never_empties() {
        let feed = Arc::new(ScriptedFeed::new(
            vec![vec![raw(post("a", "t")), raw(post("b", "t"))]],
            true,
        ));
        let fetcher = PageFetcher::new(feed.clone());
        let outcome = fetcher
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                DEFAULT_SOURCE_PATH,
                PageLimits { page_size: 2, max_pages: 3 },
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");

        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.batch.len(), 2);
        assert_eq!(outcome.duplicates_dropped, 4);
    }

    #[tokio::test]
    async fn duplicates_across_pages_keep_first_occurrence() {
        let feed = Arc::new(ScriptedFeed::new(
            vec![
                vec![raw(post("dup", "first")), raw(post("x", "t"))],
                vec![raw(post("dup", "second")), raw(post("y", "t"))],
            ],
            false,
        ));
        let outcome = PageFetcher::new(feed.clone())
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                DEFAULT_SOURCE_PATH,
                PageLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");

        let dups: Vec<_> = outcome.batch.iter().filter(|r| r.id == "dup").collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].title, "first");
        assert_eq!(outcome.batch.len(), 3);
        assert_eq!(
            *feed.cursors.lock().unwrap(),
            vec![None, Some("t3_x".to_string()), Some("t3_y".to_string())]
        );
    }

    #[tokio::test]
    async fn empty_first_page_yields_empty_batch() {
        let feed = Arc::new(ScriptedFeed::new(vec![], false));
        let outcome = PageFetcher::new(feed)
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                DEFAULT_SOURCE_PATH,
                PageLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");
        assert!(outcome.batch.is_empty());
        assert_eq!(outcome.pages, 1);
        assert!(outcome.cursor.is_start());
    }

    #[tokio::test]
    async fn cancelled_or_expired_fetch_discards_everything() {
        let feed = Arc::new(ScriptedFeed::new(vec![vec![raw(post("a", "t"))]], true));
        let fetcher = PageFetcher::new(feed);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetcher
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                DEFAULT_SOURCE_PATH,
                PageLimits::default(),
                &cancel,
            )
            .await
            .expect_err("cancelled");
        assert!(matches!(err, TransportError::Cancelled { pages: 0 }));

        let stale = Credential::new("tok", Utc::now() - Duration::minutes(1));
        let err = fetcher
            .fetch_pages(
                Uuid::new_v4(),
                &stale,
                DEFAULT_SOURCE_PATH,
                PageLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("expired");
        assert!(matches!(err, TransportError::CredentialExpired(_)));
    }

    #[tokio::test]
    async fn reddit_feed_pages_with_after_cursor_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/python/new"))
            .and(header("authorization", "bearer tok"))
            .and(query_param("limit", "2"))
            .and(query_param_is_missing("after"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing(vec![
                post("a1", "t"),
                post("a2", "t"),
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/python/new"))
            .and(query_param("after", "t3_a2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing(vec![])))
            .expect(1)
            .mount(&server)
            .await;

        let feed = Arc::new(RedditFeed::new(http(), server.uri()));
        let outcome = PageFetcher::new(feed)
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                DEFAULT_SOURCE_PATH,
                PageLimits { page_size: 2, max_pages: 10 },
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.batch.len(), 2);
    }

    #[tokio::test]
    async fn unauthorized_and_malformed_pages_abort_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/locked/new"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/garbled/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"data\": {}}"))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(Arc::new(RedditFeed::new(http(), server.uri())));
        let err = fetcher
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                "/r/locked/new",
                PageLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("401");
        assert!(matches!(err, TransportError::Unauthorized));

        let err = fetcher
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                "/r/garbled/new",
                PageLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("malformed");
        assert!(matches!(err, TransportError::MalformedBody(_)));
    }

    #[tokio::test]
    async fn password_grant_returns_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh-token",
                "token_type": "bearer",
                "expires_in": 86400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = PasswordGrantTokenProvider::new(
            http(),
            format!("{}/api/v1/access_token", server.uri()),
            test_credentials(),
        );
        let credential = provider.authenticate(Uuid::new_v4()).await.expect("auth");
        assert_eq!(credential.access_token(), "fresh-token");
        assert!(credential.expires_at() > Utc::now() + Duration::hours(23));
    }

    #[tokio::test]
    async fn auth_failures_surface_as_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/denied"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/no-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .mount(&server)
            .await;

        let denied = PasswordGrantTokenProvider::new(
            http(),
            format!("{}/denied", server.uri()),
            test_credentials(),
        );
        assert!(matches!(
            denied.authenticate(Uuid::new_v4()).await,
            Err(AuthError::Request(_))
        ));

        let no_token = PasswordGrantTokenProvider::new(
            http(),
            format!("{}/no-token", server.uri()),
            test_credentials(),
        );
        match no_token.authenticate(Uuid::new_v4()).await {
            Err(AuthError::MissingToken { error }) => {
                assert_eq!(error.as_deref(), Some("invalid_grant"))
            }
            other => panic!("expected MissingToken, got {other:?}"),
        }
    }

    #[test]
    fn mistyped_and_null_children_are_rejected_individually() {
        let mut bad_kind = post("k1", "t");
        bad_kind["kind"] = json!(3);
        let body = serde_json::to_vec(&listing(vec![
            post("a", "t"),
            bad_kind,
            JsonValue::Null,
            json!({ "kind": "t3", "data": "not an object" }),
            post("b", "t"),
        ]))
        .expect("encode");

        let items = parse_listing_page(&body).expect("envelope is valid");
        assert_eq!(items.len(), 5);

        let out = RecordNormalizer.normalize(&items);
        let ids: Vec<_> = out.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let rejected: Vec<_> = out.rejected.iter().map(|e| (e.index, e.field)).collect();
        assert_eq!(rejected, vec![(1, "kind"), (2, "kind"), (3, "data")]);
        assert_eq!(out.rejected[0].id.as_deref(), Some("k1"));

        let cursor = cursor_after_page(&items[..4]).expect("cursor");
        assert_eq!(cursor.as_param(), Some("t3_a"));
    }

    #[tokio::test]
    async fn oversized_or_negative_expires_in_is_clamped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "t",
                "expires_in": i64::MAX
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/negative"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "t",
                "expires_in": -5
            })))
            .mount(&server)
            .await;

        let huge = PasswordGrantTokenProvider::new(
            http(),
            format!("{}/huge", server.uri()),
            test_credentials(),
        );
        let credential = huge.authenticate(Uuid::new_v4()).await.expect("clamped ttl");
        let ttl = credential.expires_at() - Utc::now();
        assert!(ttl <= Duration::seconds(MAX_TOKEN_TTL_SECS));
        assert!(ttl > Duration::days(364));

        let negative = PasswordGrantTokenProvider::new(
            http(),
            format!("{}/negative", server.uri()),
            test_credentials(),
        );
        let credential = negative.authenticate(Uuid::new_v4()).await.expect("zero ttl");
        assert!(credential.is_expired_at(Utc::now()));
    }

    #[tokio::test]
    async fn slow_feed_page_times_out_as_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/python/new"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(listing(vec![post("a", "t")]))
                    .set_delay(std::time::Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let feed = RedditFeed::new(
            http_with_timeout(std::time::Duration::from_millis(100)),
            server.uri(),
        );
        let fetcher = PageFetcher::new(Arc::new(feed));
        let err = fetcher
            .fetch_pages(
                Uuid::new_v4(),
                &fresh_credential(),
                DEFAULT_SOURCE_PATH,
                PageLimits::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("timed out");
        match err {
            TransportError::Http(fetch) => assert!(fetch.is_timeout()),
            other => panic!("expected http timeout, got {other:?}"),
        }
    }
}
