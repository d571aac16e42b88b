//! C7 (articles half) — persists fetched articles, idempotent on the
//! external `inoreader_id`.

use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::Article;

pub struct SaveArticlesResult {
    pub inserted: usize,
    pub skipped: usize,
}

pub struct ArticleRepository {
    pool: sqlx::SqlitePool,
}

impl ArticleRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert each article exactly once, keyed by `inoreader_id`. Articles
    /// already resolved to a subscription are expected; an unresolved
    /// `subscription_uuid` is persisted as NULL.
    pub async fn save_articles(&self, articles: &[Article]) -> CoreResult<SaveArticlesResult> {
        let mut inserted = 0;
        let mut skipped = 0;
        let mut tx = self.pool.begin().await?;

        for article in articles {
            let result = sqlx::query(
                r#"
                INSERT INTO articles (uuid, inoreader_id, subscription_uuid, title, url, published_at, fetched_at, content_snippet)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(inoreader_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&article.inoreader_id)
            .bind(&article.subscription_uuid)
            .bind(&article.title)
            .bind(&article.url)
            .bind(article.published_at)
            .bind(article.fetched_at)
            .bind(&article.content_snippet)
            .execute(&mut tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                skipped += 1;
            }
        }

        tx.commit().await?;
        Ok(SaveArticlesResult { inserted, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_pool() -> sqlx::SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample(inoreader_id: &str) -> Article {
        let now = Utc::now();
        Article {
            inoreader_id: inoreader_id.to_string(),
            subscription_uuid: None,
            origin_stream_id: String::new(),
            title: "Title".into(),
            url: "https://example.com/a".into(),
            published_at: now,
            fetched_at: now,
            content_snippet: None,
        }
    }

    #[tokio::test]
    async fn duplicate_inoreader_id_is_skipped_not_duplicated() {
        let repo = ArticleRepository::new(test_pool().await);
        let first = repo.save_articles(&[sample("art/1")]).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.skipped, 0);

        let second = repo.save_articles(&[sample("art/1")]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
    }
}
