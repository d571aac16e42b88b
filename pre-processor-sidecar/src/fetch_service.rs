//! C10 — Article Fetch Service: one tick = pick the stalest stream, fetch
//! its next page, resolve subscription uuids, persist. Any step from the
//! remote fetch onward that fails `Transient` leaves `last_sync` untouched
//! so the same stream is retried on the next tick; `BudgetExhausted` aborts
//! before any state is written.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::gateway::InoreaderGateway;
use crate::models::SyncState;
use crate::repository::{ArticleRepository, SubscriptionRepository, SyncStateRepository};
use crate::resolver::{AutoCreator, UuidResolver};

const MAX_ARTICLES_PER_TICK: u32 = 100;

pub struct FetchOutcome {
    pub processed: usize,
    pub new: usize,
    pub errors: usize,
    pub has_continuation: bool,
}

struct RepositoryAutoCreator {
    repository: Arc<SubscriptionRepository>,
}

#[async_trait]
impl AutoCreator for RepositoryAutoCreator {
    async fn auto_create(&self, origin_stream_id: &str) -> CoreResult<String> {
        self.repository.insert_if_absent(origin_stream_id).await
    }
}

pub struct ArticleFetchService {
    gateway: Arc<InoreaderGateway>,
    subscriptions: Arc<SubscriptionRepository>,
    articles: Arc<ArticleRepository>,
    sync_state: Arc<SyncStateRepository>,
    resolver: Arc<UuidResolver>,
}

impl ArticleFetchService {
    pub fn new(
        gateway: Arc<InoreaderGateway>,
        subscriptions: Arc<SubscriptionRepository>,
        articles: Arc<ArticleRepository>,
        sync_state: Arc<SyncStateRepository>,
        resolver: Arc<UuidResolver>,
    ) -> Self {
        Self {
            gateway,
            subscriptions,
            articles,
            sync_state,
            resolver,
        }
    }

    pub async fn fetch_next_stream(&self) -> CoreResult<FetchOutcome> {
        let state = match self.sync_state.get_oldest_sync_state().await? {
            Some(state) => state,
            None => {
                info!("no sync state present, nothing to fetch yet");
                return Ok(FetchOutcome {
                    processed: 0,
                    new: 0,
                    errors: 0,
                    has_continuation: false,
                });
            }
        };

        let subs = self.subscriptions.list_all().await?;
        let mapping = crate::models::SubscriptionMapping::from_subscriptions(&subs);

        let fetch_result = self
            .gateway
            .fetch_stream(&state.stream_id, MAX_ARTICLES_PER_TICK, state.continuation_token.as_deref())
            .await;

        let page = match fetch_result {
            Ok(page) => page,
            Err(CoreError::BudgetExhausted) => {
                warn!(stream_id = %state.stream_id, "article fetch aborted: daily budget exhausted");
                return Err(CoreError::BudgetExhausted);
            }
            Err(e @ CoreError::Transient(_)) => {
                self.sync_state
                    .upsert_sync_state(&SyncState {
                        stream_id: state.stream_id.clone(),
                        last_sync: state.last_sync,
                        continuation_token: state.continuation_token.clone(),
                        last_error: Some(e.to_string()),
                    })
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let auto_creator = RepositoryAutoCreator {
            repository: self.subscriptions.clone(),
        };
        let (resolved, resolution) = self
            .resolver
            .resolve(page.articles, &mapping, &auto_creator)
            .await;

        let save_result = self.articles.save_articles(&resolved).await?;

        self.sync_state
            .upsert_sync_state(&SyncState {
                stream_id: state.stream_id.clone(),
                last_sync: Utc::now(),
                continuation_token: page.next_continuation.clone(),
                last_error: None,
            })
            .await?;

        info!(
            stream_id = %state.stream_id,
            inserted = save_result.inserted,
            skipped = save_result.skipped,
            errors = resolution.errors.len(),
            "article fetch tick completed"
        );

        Ok(FetchOutcome {
            processed: resolution.total_processed,
            new: save_result.inserted,
            errors: resolution.errors.len(),
            has_continuation: page.next_continuation.is_some(),
        })
    }
}
