//! Core domain model for the Reddit extract-and-load pipeline.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "retl-core";

/// Wire format of every canonical timestamp (`2023-11-14T22:13:20Z`).
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Credentials are treated as expired this long before the identity endpoint says so.
const EXPIRY_SKEW_SECS: i64 = 30;

/// Bearer credential for the feed API. Valid for one pipeline run at most.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }

    /// Value of the `Authorization` header the feed API expects.
    pub fn authorization_header(&self) -> String {
        format!("bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Resume point in the feed: the `kind_id` fullname of the last item seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(Option<String>);

impl Cursor {
    pub fn start() -> Self {
        Self(None)
    }

    pub fn after_item(kind: &str, id: &str) -> Self {
        Self(Some(format!("{kind}_{id}")))
    }

    pub fn as_param(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_start(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(fullname) => f.write_str(fullname),
            None => f.write_str("<start>"),
        }
    }
}

/// Normalized, flat representation of one feed post. Field names double as the
/// staging CSV headers and the `reddit_posts` column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub subreddit: String,
    pub title: String,
    pub selftext: String,
    pub upvote_ratio: f64,
    pub ups: i64,
    pub downs: i64,
    pub score: i64,
    #[serde(with = "iso_seconds")]
    pub created_utc: DateTime<Utc>,
    pub id: String,
    pub kind: String,
}

impl CanonicalRecord {
    pub const COLUMNS: [&'static str; 10] = [
        "subreddit",
        "title",
        "selftext",
        "upvote_ratio",
        "ups",
        "downs",
        "score",
        "created_utc",
        "id",
        "kind",
    ];

    pub fn fullname(&self) -> String {
        format!("{}_{}", self.kind, self.id)
    }

    pub fn created_utc_string(&self) -> String {
        format_timestamp(self.created_utc)
    }
}

/// Converts feed epoch seconds (always UTC) into a timestamp, truncating any fraction.
pub fn timestamp_from_epoch(epoch_secs: f64) -> Option<DateTime<Utc>> {
    if !epoch_secs.is_finite() {
        return None;
    }
    let secs = epoch_secs.trunc();
    if secs < i64::MIN as f64 || secs > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0)
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(CANONICAL_TIMESTAMP_FORMAT).to_string()
}

/// Serde adapter pinning timestamps to [`CANONICAL_TIMESTAMP_FORMAT`].
pub mod iso_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| D::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
    }
}

/// Ordered records from one fetch run. No two records share an `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    records: Vec<CanonicalRecord>,
}

impl Batch {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Collapses records sharing an `id`, keeping the first one in scan order.
    /// Returns the batch and how many records were dropped.
    pub fn dedup_keep_first(records: impl IntoIterator<Item = CanonicalRecord>) -> (Self, usize) {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for record in records {
            if seen.insert(record.id.clone()) {
                kept.push(record);
            } else {
                dropped += 1;
            }
        }
        (Self { records: kept }, dropped)
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.iter()
    }
}

/// Handoff reference from the fetch unit to the load unit of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedArtifactRef {
    pub run_id: Uuid,
    pub path: PathBuf,
    pub content_hash: String,
    pub record_count: usize,
    pub byte_size: usize,
}

/// One raw feed item that could not be mapped. Recorded and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "malformed item #{index} ({}): field `{field}` {reason}",
    .id.as_deref().unwrap_or("no id")
)]
pub struct MalformedRecordError {
    pub index: usize,
    pub id: Option<String>,
    pub field: &'static str,
    pub reason: String,
}
