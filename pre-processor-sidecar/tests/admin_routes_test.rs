// Exercises the admin HTTP surface (C12) end to end through Rocket's own
// local async client, since neither request routing nor auth rejection is
// observable from unit tests alone.

use pre_processor_sidecar::admin::{build_rocket, AdminState};
use pre_processor_sidecar::gateway::InoreaderGateway;
use pre_processor_sidecar::rate_limit::RateLimiter;
use pre_processor_sidecar::repository::{ArticleRepository, SubscriptionRepository, SyncStateRepository};
use pre_processor_sidecar::resolver::UuidResolver;
use pre_processor_sidecar::fetch_service::ArticleFetchService;
use pre_processor_sidecar::scheduler::ScheduleHandler;
use pre_processor_sidecar::sync_service::SubscriptionSyncService;
use pre_processor_sidecar::token::oauth_client::OAuth2Client;
use pre_processor_sidecar::token::service::TokenService;
use pre_processor_sidecar::token::store::{EnvVarTokenStore, TokenStore};
use rocket::http::{Header, Status};
use rocket::local::asynchronous::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

const BEARER: &str = "test-admin-secret";

async fn test_client() -> Client {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("../migrations").run(&pool).await.unwrap();

    let store: Arc<dyn TokenStore> = Arc::new(EnvVarTokenStore::new(Some("at".into()), Some("rt".into())));
    let oauth_client = Arc::new(OAuth2Client::new("http://127.0.0.1:1", "id", "secret").unwrap());
    let token_service = Arc::new(TokenService::new(store, oauth_client, Duration::from_secs(1800)));
    let tuple = pre_processor_sidecar::models::TokenTuple {
        access_token: "valid-at".into(),
        refresh_token: "rt".into(),
        token_type: "Bearer".into(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        issued_at: chrono::Utc::now(),
    };
    token_service.observe_external_change(tuple).await;

    let rate_limiter = Arc::new(RateLimiter::new(100));
    let gateway = Arc::new(
        InoreaderGateway::new("http://127.0.0.1:1".into(), None, token_service.clone(), rate_limiter).unwrap(),
    );

    let subscription_repo = Arc::new(SubscriptionRepository::new(pool.clone()));
    let article_repo = Arc::new(ArticleRepository::new(pool.clone()));
    let sync_state_repo = Arc::new(SyncStateRepository::new(pool.clone()));
    let resolver = Arc::new(UuidResolver::new());

    let sync_service = Arc::new(SubscriptionSyncService::new(
        gateway.clone(),
        subscription_repo.clone(),
        sync_state_repo.clone(),
    ));
    let fetch_service = Arc::new(ArticleFetchService::new(
        gateway,
        subscription_repo,
        article_repo,
        sync_state_repo,
        resolver,
    ));

    let scheduler = Arc::new(ScheduleHandler::new(
        sync_service,
        fetch_service,
        Duration::from_secs(3600),
        Duration::from_secs(300),
        Duration::from_secs(0),
    ));

    let state = AdminState::new(token_service, scheduler, BEARER.to_string(), 1000);
    let rocket = build_rocket(state, 0);
    Client::tracked(rocket).await.expect("valid rocket instance")
}

#[tokio::test]
async fn token_status_requires_bearer_auth() {
    let client = test_client().await;

    let unauthenticated = client.get("/admin/oauth2/token-status").dispatch().await;
    assert_eq!(unauthenticated.status(), Status::Unauthorized);

    let authenticated = client
        .get("/admin/oauth2/token-status")
        .header(Header::new("Authorization", format!("Bearer {BEARER}")))
        .dispatch()
        .await;
    assert_eq!(authenticated.status(), Status::Ok);
    let body = authenticated.into_string().await.unwrap();
    assert!(body.contains("\"is_valid\":true"));
}

#[tokio::test]
async fn wrong_bearer_token_is_rejected() {
    let client = test_client().await;
    let response = client
        .get("/admin/oauth2/token-status")
        .header(Header::new("Authorization", "Bearer not-the-secret"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);
}

#[tokio::test]
async fn rotate_refresh_token_rejects_empty_body_field() {
    let client = test_client().await;
    let response = client
        .post("/admin/oauth2/refresh-token")
        .header(Header::new("Authorization", format!("Bearer {BEARER}")))
        .header(Header::new("Content-Type", "application/json"))
        .body(r#"{"refresh_token":""}"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[tokio::test]
async fn trigger_article_fetch_accepts_with_no_sync_state_seeded() {
    let client = test_client().await;
    let auth = Header::new("Authorization", format!("Bearer {BEARER}"));

    let response = client
        .post("/admin/trigger/article-fetch")
        .header(auth)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
}
