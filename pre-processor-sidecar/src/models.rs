//! Core data model: the value objects shared across components, per the
//! data model section of the design. These are plain structs; persistence
//! mapping lives in the `repository` module's `FromRow` companion types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// The current OAuth2 credential tuple. `expires_at` must be strictly after
/// `issued_at`; both tokens are non-empty whenever the tuple is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenTuple {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

impl TokenTuple {
    pub fn is_well_formed(&self) -> bool {
        !self.access_token.is_empty()
            && !self.refresh_token.is_empty()
            && self.expires_at > self.issued_at
    }

    pub fn expires_in(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

/// Read-only projection of C3's internal state, recomputed on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStatus {
    pub is_valid: bool,
    pub expires_in_seconds: i64,
    pub is_refreshing: bool,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub is_in_recovery_mode: bool,
}

/// Rolling daily API budget. `used_count` never exceeds `daily_limit`;
/// `day_bucket` is the UTC calendar day the counter applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub day_bucket: chrono::NaiveDate,
    pub used_count: u32,
    pub daily_limit: u32,
    pub zone: String,
}

impl RateLimitState {
    pub fn remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.used_count)
    }
}

/// A feed subscription, keyed naturally by the external Inoreader id.
/// `uuid` is assigned once and never changes thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub uuid: String,
    pub inoreader_id: String,
    pub title: String,
    pub feed_url: String,
    pub category: Option<String>,
    pub icon_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-stream cursor/timestamp bookkeeping, one row per remote stream.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncState {
    pub stream_id: String,
    pub last_sync: DateTime<Utc>,
    pub continuation_token: Option<String>,
    pub last_error: Option<String>,
}

/// A fetched article as it flows through the core. `origin_stream_id` is
/// transient: it must be cleared to empty before the article leaves C8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub inoreader_id: String,
    pub subscription_uuid: Option<String>,
    pub origin_stream_id: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub content_snippet: Option<String>,
}

/// In-memory, thread-safe bidirectional index between external stream ids
/// and internal subscription uuids. Built fresh (or reused) at the start of
/// a fetch cycle; mutated only through auto-creation.
#[derive(Debug, Default)]
pub struct SubscriptionMapping {
    inner: RwLock<MappingInner>,
}

#[derive(Debug, Default)]
struct MappingInner {
    stream_to_uuid: HashMap<String, String>,
    uuid_to_stream: HashMap<String, String>,
}

impl SubscriptionMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_subscriptions(subs: &[Subscription]) -> Self {
        let mapping = Self::new();
        for sub in subs {
            mapping.insert(sub.inoreader_id.clone(), sub.uuid.clone());
        }
        mapping
    }

    pub fn lookup_by_stream(&self, stream_id: &str) -> Option<String> {
        self.inner
            .read()
            .expect("subscription mapping lock poisoned")
            .stream_to_uuid
            .get(stream_id)
            .cloned()
    }

    pub fn lookup_by_uuid(&self, uuid: &str) -> Option<String> {
        self.inner
            .read()
            .expect("subscription mapping lock poisoned")
            .uuid_to_stream
            .get(uuid)
            .cloned()
    }

    pub fn insert(&self, stream_id: String, uuid: String) {
        let mut inner = self.inner.write().expect("subscription mapping lock poisoned");
        inner.uuid_to_stream.insert(uuid.clone(), stream_id.clone());
        inner.stream_to_uuid.insert(stream_id, uuid);
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("subscription mapping lock poisoned")
            .stream_to_uuid
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SubscriptionSync,
    ArticleFetch,
}

/// Emitted by the schedule handler to registered observers after a job
/// instance completes, whether it succeeded or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_type: JobType,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionErrorCode {
    ValidationError,
    AutoCreationError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionError {
    pub article_inoreader_id: String,
    pub origin_stream_id: String,
    pub message: String,
    pub code: ResolutionErrorCode,
}

/// Per-batch accounting returned by the UUID resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub resolved_count: usize,
    pub auto_created_count: usize,
    pub unknown_count: usize,
    pub total_processed: usize,
    pub errors: Vec<ResolutionError>,
}
