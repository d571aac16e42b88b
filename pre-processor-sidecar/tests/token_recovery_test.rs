// Exercises C3 across a full cold-start -> serving -> auth-rejected ->
// recovery-mode cycle, and the C3/C5 interaction on a single 401.

use pre_processor_sidecar::error::CoreError;
use pre_processor_sidecar::gateway::InoreaderGateway;
use pre_processor_sidecar::rate_limit::RateLimiter;
use pre_processor_sidecar::token::oauth_client::OAuth2Client;
use pre_processor_sidecar::token::service::TokenService;
use pre_processor_sidecar::token::store::{EnvVarTokenStore, TokenStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn persistent_auth_rejection_enters_recovery_and_future_calls_fail_fast() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let store: Arc<dyn TokenStore> = Arc::new(EnvVarTokenStore::new(None, Some("rt-stale".into())));
    let oauth_client = Arc::new(OAuth2Client::new(&server.url(), "id", "secret").unwrap());
    let service = TokenService::new(store, oauth_client, Duration::from_secs(1800));

    let bootstrap_result = service.bootstrap().await;
    assert!(bootstrap_result.is_err(), "bootstrap with a dead refresh token must fail");

    let status = service.status().await;
    assert!(status.is_in_recovery_mode);
    assert_eq!(status.consecutive_failures, 1);

    // A second attempt increments the failure count further without panicking
    // or silently recovering on its own.
    let second = service.force_refresh().await;
    assert!(second.is_err());
    let status_after = service.status().await;
    assert_eq!(status_after.consecutive_failures, 2);
}

#[tokio::test]
async fn gateway_forces_single_refresh_on_401_then_succeeds() {
    let mut server = mockito::Server::new_async().await;

    let _refresh_mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-fresh","refresh_token":"rt-fresh","expires_in":3600}"#)
        .create_async()
        .await;

    // First call with the stale token is rejected; once the gateway forces a
    // refresh and retries with the bearer header carrying the new token, it
    // succeeds.
    let _unauthorized_mock = server
        .mock("GET", "/subscription/list")
        .match_header("authorization", "Bearer stale-token")
        .with_status(401)
        .create_async()
        .await;
    let _authorized_mock = server
        .mock("GET", "/subscription/list")
        .match_header("authorization", "Bearer at-fresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"subscriptions":[]}"#)
        .create_async()
        .await;

    let store: Arc<dyn TokenStore> = Arc::new(EnvVarTokenStore::new(Some("stale-token".into()), Some("rt-0".into())));
    let oauth_client = Arc::new(OAuth2Client::new(&server.url(), "id", "secret").unwrap());
    let token_service = Arc::new(TokenService::new(store, oauth_client, Duration::from_secs(1800)));

    let stale_tuple = pre_processor_sidecar::models::TokenTuple {
        access_token: "stale-token".into(),
        refresh_token: "rt-0".into(),
        token_type: "Bearer".into(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        issued_at: chrono::Utc::now(),
    };
    token_service.observe_external_change(stale_tuple).await;

    let rate_limiter = Arc::new(RateLimiter::new(100));
    let gateway = InoreaderGateway::new(server.url(), None, token_service.clone(), rate_limiter).unwrap();

    let subs = gateway.list_subscriptions().await.expect("gateway recovers after forced refresh");
    assert!(subs.is_empty());

    let status = token_service.status().await;
    assert!(status.is_valid);
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn second_consecutive_401_after_retry_is_a_terminal_auth_rejection() {
    let mut server = mockito::Server::new_async().await;
    let _refresh_mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"at-still-bad","refresh_token":"rt-1","expires_in":3600}"#)
        .create_async()
        .await;
    let _always_401 = server
        .mock("GET", "/subscription/list")
        .with_status(401)
        .expect_at_least(2)
        .create_async()
        .await;

    let store: Arc<dyn TokenStore> = Arc::new(EnvVarTokenStore::new(Some("at-0".into()), Some("rt-0".into())));
    let oauth_client = Arc::new(OAuth2Client::new(&server.url(), "id", "secret").unwrap());
    let token_service = Arc::new(TokenService::new(store, oauth_client, Duration::from_secs(1800)));
    let tuple = pre_processor_sidecar::models::TokenTuple {
        access_token: "at-0".into(),
        refresh_token: "rt-0".into(),
        token_type: "Bearer".into(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        issued_at: chrono::Utc::now(),
    };
    token_service.observe_external_change(tuple).await;

    let rate_limiter = Arc::new(RateLimiter::new(100));
    let gateway = InoreaderGateway::new(server.url(), None, token_service, rate_limiter).unwrap();

    let result = gateway.list_subscriptions().await;
    assert!(matches!(result, Err(CoreError::AuthRejected(_))));
}
