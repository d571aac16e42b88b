//! C8 — UUID Resolver: a pure domain function, with I/O only through the
//! injected `AutoCreator` capability. Resolves `origin_stream_id` against
//! a `SubscriptionMapping`, auto-creating on miss, and clears the transient
//! field only after the whole batch has been processed — that ordering is
//! load-bearing (`origin_stream_id` must survive every lookup in the batch
//! but must not leak past the resolver).

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::CoreResult;
use crate::models::{Article, ResolutionError, ResolutionErrorCode, ResolutionResult, SubscriptionMapping};

#[async_trait]
pub trait AutoCreator: Send + Sync {
    /// Create a subscription row for a stream id never seen before,
    /// returning its freshly assigned uuid.
    async fn auto_create(&self, origin_stream_id: &str) -> CoreResult<String>;
}

/// Serializes auto-creation per `origin_stream_id` so concurrent batches
/// sharing a mapping never race to create duplicate subscriptions for the
/// same stream.
pub struct UuidResolver {
    creation_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl Default for UuidResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl UuidResolver {
    pub fn new() -> Self {
        Self {
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, key: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn resolve(
        &self,
        mut batch: Vec<Article>,
        mapping: &SubscriptionMapping,
        auto_creator: &dyn AutoCreator,
    ) -> (Vec<Article>, ResolutionResult) {
        let mut result = ResolutionResult::default();
        result.total_processed = batch.len();

        for article in batch.iter_mut() {
            if article.origin_stream_id.is_empty() {
                result.unknown_count += 1;
                result.errors.push(ResolutionError {
                    article_inoreader_id: article.inoreader_id.clone(),
                    origin_stream_id: article.origin_stream_id.clone(),
                    message: "article has no origin stream id".to_string(),
                    code: ResolutionErrorCode::ValidationError,
                });
                continue;
            }

            if let Some(uuid) = mapping.lookup_by_stream(&article.origin_stream_id) {
                article.subscription_uuid = Some(uuid);
                result.resolved_count += 1;
                continue;
            }

            let stream_id = article.origin_stream_id.clone();
            let per_stream_lock = self.lock_for(&stream_id).await;
            let _guard = per_stream_lock.lock().await;

            // Another task may have created it while we waited for the lock.
            if let Some(uuid) = mapping.lookup_by_stream(&stream_id) {
                article.subscription_uuid = Some(uuid);
                result.resolved_count += 1;
                continue;
            }

            match auto_creator.auto_create(&stream_id).await {
                Ok(uuid) => {
                    mapping.insert(stream_id.clone(), uuid.clone());
                    article.subscription_uuid = Some(uuid);
                    result.auto_created_count += 1;
                }
                Err(e) => {
                    article.subscription_uuid = None;
                    result.unknown_count += 1;
                    result.errors.push(ResolutionError {
                        article_inoreader_id: article.inoreader_id.clone(),
                        origin_stream_id: stream_id,
                        message: e.to_string(),
                        code: ResolutionErrorCode::AutoCreationError,
                    });
                }
            }
        }

        for article in batch.iter_mut() {
            article.origin_stream_id.clear();
        }

        (batch, result)
    }
}
