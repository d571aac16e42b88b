//! C7 (sync-state half) — per-stream cursor bookkeeping. `get_oldest`
//! drives the round-robin fairness C10 relies on: the stream with the
//! stalest `last_sync` goes next, ties broken lexicographically by
//! `stream_id`.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::CoreResult;
use crate::models::SyncState;

pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_oldest_sync_state(&self) -> CoreResult<Option<SyncState>> {
        let state = sqlx::query_as::<_, SyncState>(
            "SELECT stream_id, last_sync, continuation_token, last_error FROM sync_state ORDER BY last_sync ASC, stream_id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    pub async fn upsert_sync_state(&self, state: &SyncState) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (stream_id, last_sync, continuation_token, last_error)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(stream_id) DO UPDATE SET
                last_sync = excluded.last_sync,
                continuation_token = excluded.continuation_token,
                last_error = excluded.last_error
            "#,
        )
        .bind(&state.stream_id)
        .bind(state.last_sync)
        .bind(&state.continuation_token)
        .bind(&state.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ensure a row exists for every known stream id, seeding `last_sync`
    /// far enough in the past that a brand-new stream is picked up promptly
    /// by the round-robin ordering.
    pub async fn ensure_seeded(&self, stream_ids: &[String]) -> CoreResult<()> {
        let epoch: DateTime<Utc> = DateTime::from_timestamp(0, 0).expect("epoch is a valid timestamp");
        for stream_id in stream_ids {
            sqlx::query(
                "INSERT INTO sync_state (stream_id, last_sync, continuation_token, last_error) VALUES (?, ?, NULL, NULL) ON CONFLICT(stream_id) DO NOTHING",
            )
            .bind(stream_id)
            .bind(epoch)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn oldest_sync_state_breaks_ties_lexicographically() {
        let repo = SyncStateRepository::new(test_pool().await);
        let same_time = Utc::now();
        repo.upsert_sync_state(&SyncState {
            stream_id: "feed/b".into(),
            last_sync: same_time,
            continuation_token: None,
            last_error: None,
        })
        .await
        .unwrap();
        repo.upsert_sync_state(&SyncState {
            stream_id: "feed/a".into(),
            last_sync: same_time,
            continuation_token: None,
            last_error: None,
        })
        .await
        .unwrap();

        let oldest = repo.get_oldest_sync_state().await.unwrap().unwrap();
        assert_eq!(oldest.stream_id, "feed/a");
    }

    #[tokio::test]
    async fn round_robin_advances_after_upsert() {
        let repo = SyncStateRepository::new(test_pool().await);
        repo.ensure_seeded(&["feed/a".into(), "feed/b".into()]).await.unwrap();

        let first = repo.get_oldest_sync_state().await.unwrap().unwrap();
        repo.upsert_sync_state(&SyncState {
            stream_id: first.stream_id.clone(),
            last_sync: Utc::now(),
            continuation_token: None,
            last_error: None,
        })
        .await
        .unwrap();

        let second = repo.get_oldest_sync_state().await.unwrap().unwrap();
        assert_ne!(first.stream_id, second.stream_id);
    }
}
