use pre_processor_sidecar::gateway::InoreaderGateway;
use pre_processor_sidecar::rate_limit::RateLimiter;
use pre_processor_sidecar::repository::{SubscriptionRepository, SyncStateRepository};
use pre_processor_sidecar::sync_service::SubscriptionSyncService;
use pre_processor_sidecar::token::oauth_client::OAuth2Client;
use pre_processor_sidecar::token::service::TokenService;
use pre_processor_sidecar::token::store::{EnvVarTokenStore, TokenStore};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("../migrations").run(&pool).await.unwrap();
    pool
}

async fn valid_token_service(base_url: &str) -> Arc<TokenService> {
    let store: Arc<dyn TokenStore> = Arc::new(EnvVarTokenStore::new(Some("at".into()), Some("rt".into())));
    let oauth_client = Arc::new(OAuth2Client::new(base_url, "id", "secret").unwrap());
    let service = Arc::new(TokenService::new(store, oauth_client, Duration::from_secs(1800)));
    let tuple = pre_processor_sidecar::models::TokenTuple {
        access_token: "valid-at".into(),
        refresh_token: "rt".into(),
        token_type: "Bearer".into(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        issued_at: chrono::Utc::now(),
    };
    service.observe_external_change(tuple).await;
    service
}

#[tokio::test]
async fn full_catalog_refresh_persists_new_and_returning_subscriptions() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/subscription/list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"subscriptions":[
                {"id":"feed/1","title":"Feed One","url":"https://example.com/1","categories":[{"label":"tech"}]},
                {"id":"feed/2","title":"Feed Two","url":"https://example.com/2","categories":[]}
            ]}"#,
        )
        .create_async()
        .await;

    let token_service = valid_token_service(&server.url()).await;
    let rate_limiter = Arc::new(RateLimiter::new(100));
    let gateway = Arc::new(InoreaderGateway::new(server.url(), None, token_service, rate_limiter).unwrap());
    let pool = test_pool().await;
    let repo = Arc::new(SubscriptionRepository::new(pool.clone()));
    let sync_state_repo = Arc::new(SyncStateRepository::new(pool));

    let service = SubscriptionSyncService::new(gateway, repo.clone(), sync_state_repo.clone());
    let outcome = service.sync().await.expect("sync succeeds");
    assert_eq!(outcome.count, 2);

    let all = repo.list_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|s| s.inoreader_id == "feed/1" && s.category.as_deref() == Some("tech")));

    // A sync_state row now exists for each newly discovered stream, so the
    // article-fetch rotation can pick it up.
    let oldest = sync_state_repo.get_oldest_sync_state().await.unwrap();
    assert!(oldest.is_some());

    // Re-sync with an updated title should not duplicate rows or reassign uuids.
    let first_uuid = repo.get_by_inoreader_id("feed/1").await.unwrap().unwrap().uuid;
    let outcome2 = service.sync().await.expect("second sync succeeds");
    assert_eq!(outcome2.count, 2);
    let second_uuid = repo.get_by_inoreader_id("feed/1").await.unwrap().unwrap().uuid;
    assert_eq!(first_uuid, second_uuid);
}

#[tokio::test]
async fn empty_subscription_list_is_not_an_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/subscription/list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"subscriptions":[]}"#)
        .create_async()
        .await;

    let token_service = valid_token_service(&server.url()).await;
    let rate_limiter = Arc::new(RateLimiter::new(100));
    let gateway = Arc::new(InoreaderGateway::new(server.url(), None, token_service, rate_limiter).unwrap());
    let pool = test_pool().await;
    let repo = Arc::new(SubscriptionRepository::new(pool.clone()));
    let sync_state_repo = Arc::new(SyncStateRepository::new(pool));

    let service = SubscriptionSyncService::new(gateway, repo, sync_state_repo);
    let outcome = service.sync().await.expect("empty sync is not an error");
    assert_eq!(outcome.count, 0);
}
