//! C6 — Subscription Repository: upsert-and-list against the
//! `subscriptions` table, keyed naturally by `inoreader_id`.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::Subscription;

pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a batch in a single transaction. Never changes an existing
    /// `uuid`; the incoming fields overwrite everything else.
    pub async fn upsert_many(&self, subs: &[Subscription]) -> CoreResult<usize> {
        if subs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for sub in subs {
            let uuid = sub.uuid.clone();
            let uuid = if uuid.is_empty() { Uuid::new_v4().to_string() } else { uuid };

            sqlx::query(
                r#"
                INSERT INTO subscriptions (uuid, inoreader_id, title, feed_url, category, icon_url, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(inoreader_id) DO UPDATE SET
                    title = excluded.title,
                    feed_url = excluded.feed_url,
                    category = excluded.category,
                    icon_url = excluded.icon_url,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&uuid)
            .bind(&sub.inoreader_id)
            .bind(&sub.title)
            .bind(&sub.feed_url)
            .bind(&sub.category)
            .bind(&sub.icon_url)
            .bind(now)
            .bind(now)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        info!(count = subs.len(), "upserted subscription batch");
        Ok(subs.len())
    }

    pub async fn list_all(&self) -> CoreResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            "SELECT uuid, inoreader_id, title, feed_url, category, icon_url, created_at, updated_at FROM subscriptions",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    pub async fn get_by_inoreader_id(&self, inoreader_id: &str) -> CoreResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            "SELECT uuid, inoreader_id, title, feed_url, category, icon_url, created_at, updated_at FROM subscriptions WHERE inoreader_id = ?",
        )
        .bind(inoreader_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Used by auto-creation: insert a bare-bones subscription row for a
    /// stream id never seen before, returning its freshly assigned uuid.
    /// No-op (returns the existing uuid) if the row already exists.
    pub async fn insert_if_absent(&self, inoreader_id: &str) -> CoreResult<String> {
        if let Some(existing) = self.get_by_inoreader_id(inoreader_id).await? {
            return Ok(existing.uuid);
        }

        let uuid = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (uuid, inoreader_id, title, feed_url, category, icon_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, NULL, ?, ?)
            ON CONFLICT(inoreader_id) DO NOTHING
            "#,
        )
        .bind(&uuid)
        .bind(inoreader_id)
        .bind(inoreader_id)
        .bind(inoreader_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Another concurrent auto-creation may have won the race; return
        // whichever uuid actually landed.
        match self.get_by_inoreader_id(inoreader_id).await? {
            Some(sub) => Ok(sub.uuid),
            None => Ok(uuid),
        }
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

    fn sample(inoreader_id: &str, title: &str) -> Subscription {
        let now = Utc::now();
        Subscription {
            uuid: String::new(),
            inoreader_id: inoreader_id.to_string(),
            title: title.to_string(),
            feed_url: format!("https://example.com/{inoreader_id}"),
            category: Some("news".to_string()),
            icon_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_then_upsert_again_keeps_uuid_stable() {
        let repo = SubscriptionRepository::new(test_pool().await);
        repo.upsert_many(&[sample("feed/1", "Original")]).await.unwrap();
        let first = repo.get_by_inoreader_id("feed/1").await.unwrap().unwrap();

        let mut renamed = sample("feed/1", "Renamed");
        renamed.uuid = String::new();
        repo.upsert_many(&[renamed]).await.unwrap();
        let second = repo.get_by_inoreader_id("feed/1").await.unwrap().unwrap();

        assert_eq!(first.uuid, second.uuid);
        assert_eq!(second.title, "Renamed");
    }

    #[tokio::test]
    async fn insert_if_absent_is_idempotent() {
        let repo = SubscriptionRepository::new(test_pool().await);
        let uuid1 = repo.insert_if_absent("feed/new").await.unwrap();
        let uuid2 = repo.insert_if_absent("feed/new").await.unwrap();
        assert_eq!(uuid1, uuid2);
    }
}
