//! C9 — Subscription Sync Service: full refresh of the subscription
//! catalog. Thin orchestration over C5 and C6; a zero-result response is
//! logged prominently but is not itself an error.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::gateway::InoreaderGateway;
use crate::repository::{SubscriptionRepository, SyncStateRepository};

pub struct SyncOutcome {
    pub count: usize,
}

pub struct SubscriptionSyncService {
    gateway: Arc<InoreaderGateway>,
    repository: Arc<SubscriptionRepository>,
    sync_state: Arc<SyncStateRepository>,
}

impl SubscriptionSyncService {
    pub fn new(
        gateway: Arc<InoreaderGateway>,
        repository: Arc<SubscriptionRepository>,
        sync_state: Arc<SyncStateRepository>,
    ) -> Self {
        Self {
            gateway,
            repository,
            sync_state,
        }
    }

    pub async fn sync(&self) -> CoreResult<SyncOutcome> {
        let subscriptions = self.gateway.list_subscriptions().await?;

        if subscriptions.is_empty() {
            warn!("subscription sync returned zero subscriptions");
            return Ok(SyncOutcome { count: 0 });
        }

        let count = self.repository.upsert_many(&subscriptions).await?;

        let stream_ids: Vec<String> = subscriptions.into_iter().map(|s| s.inoreader_id).collect();
        self.sync_state.ensure_seeded(&stream_ids).await?;

        info!(count, "subscription sync completed");
        Ok(SyncOutcome { count })
    }
}
