//! C2 — OAuth2 Client: exchanges a refresh token for a new access+refresh
//! pair. Deliberately uses its own `reqwest::Client`, built with
//! `.no_proxy()`, so the token endpoint is never routed through the
//! data-plane egress proxy C5 uses — avoiding a circular dependency on a
//! service whose own tokens this client mints.

use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::TokenTuple;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OAuth2Client {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuth2Client {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .user_agent("pre-processor-sidecar/oauth2-client")
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build oauth2 http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Exchange `refresh_token` for a fresh `TokenTuple`. A 4xx response is
    /// classified `AuthRejected` and must not be retried by the caller;
    /// 5xx and network failures are `Transient`.
    pub async fn refresh(&self, refresh_token: &str) -> CoreResult<TokenTuple> {
        let dispatched_at = Utc::now();

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];

        let response = self
            .http
            .post(format!("{}/token", self.base_url.trim_end_matches('/')))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::Transient(format!("oauth2 refresh request failed: {e}"))
                } else {
                    CoreError::Transient(e.to_string())
                }
            })?;

        let status = response.status();

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "refresh token rejected by authorization server");
            return Err(CoreError::AuthRejected(format!(
                "authorization server rejected refresh: {status} {body}"
            )));
        }

        if status.is_server_error() {
            return Err(CoreError::Transient(format!(
                "authorization server returned {status}"
            )));
        }

        if !status.is_success() {
            return Err(CoreError::Transient(format!(
                "unexpected authorization server status {status}"
            )));
        }

        let body: OAuth2TokenResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Malformed(format!("failed to parse token response: {e}")))?;

        let expires_at = dispatched_at + chrono::Duration::seconds(body.expires_in as i64);

        info!("oauth2 refresh succeeded, new token expires_in={}s", body.expires_in);

        Ok(TokenTuple {
            access_token: body.access_token,
            refresh_token: body.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            issued_at: dispatched_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuth2TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_refresh_computes_expiry_from_dispatch_time() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-1","refresh_token":"rt-2","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;

        let client = OAuth2Client::new(server.url(), "client-id", "client-secret").unwrap();
        let before = Utc::now();
        let tuple = client.refresh("rt-abc").await.expect("refresh succeeds");
        let after = Utc::now();

        assert_eq!(tuple.access_token, "at-1");
        assert_eq!(tuple.refresh_token, "rt-2");
        assert!(tuple.issued_at >= before && tuple.issued_at <= after);
        let expires_in = (tuple.expires_at - tuple.issued_at).num_seconds();
        assert!((3590..=3600).contains(&expires_in));
    }

    #[tokio::test]
    async fn invalid_grant_is_auth_rejected_not_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let client = OAuth2Client::new(server.url(), "client-id", "client-secret").unwrap();
        let result = client.refresh("rt-revoked").await;
        assert!(matches!(result, Err(CoreError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(503)
            .create_async()
            .await;

        let client = OAuth2Client::new(server.url(), "client-id", "client-secret").unwrap();
        let result = client.refresh("rt-abc").await;
        assert!(matches!(result, Err(CoreError::Transient(_))));
    }
}
