//! C5 — Inoreader Gateway: the only component that speaks HTTPS to the
//! remote reader API. Every call reserves quota from C4 before dialing out,
//! obtains a token from C3, and on a single 401 forces a refresh and retries
//! exactly once before giving up.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::models::{Article, Subscription};
use crate::rate_limit::RateLimiter;
use crate::token::service::TokenService;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct StreamPage {
    pub articles: Vec<Article>,
    pub next_continuation: Option<String>,
}

/// Data-plane HTTP transport, potentially routed through a proxy sidecar —
/// distinct from C2's direct-dial client.
pub struct InoreaderGateway {
    http: reqwest::Client,
    base_url: String,
    token_service: Arc<TokenService>,
    rate_limiter: Arc<RateLimiter>,
}

impl InoreaderGateway {
    pub fn new(
        base_url: impl Into<String>,
        https_proxy: Option<String>,
        token_service: Arc<TokenService>,
        rate_limiter: Arc<RateLimiter>,
    ) -> CoreResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("pre-processor-sidecar/inoreader-gateway");

        if let Some(proxy_url) = https_proxy {
            let proxy = reqwest::Proxy::https(&proxy_url)
                .map_err(|e| CoreError::Internal(format!("invalid https proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build gateway http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            token_service,
            rate_limiter,
        })
    }

    pub async fn list_subscriptions(&self) -> CoreResult<Vec<Subscription>> {
        let body: SubscriptionListResponse = self
            .call("subscription/list", &[])
            .await?
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("failed to parse subscription list: {e}")))?;

        let now = Utc::now();
        Ok(body
            .subscriptions
            .into_iter()
            .map(|s| Subscription {
                uuid: String::new(),
                inoreader_id: s.id,
                title: s.title,
                feed_url: s.url,
                category: s.categories.into_iter().next().map(|c| c.label),
                icon_url: s.icon_url,
                created_at: now,
                updated_at: now,
            })
            .collect())
    }

    pub async fn fetch_stream(
        &self,
        stream_id: &str,
        max_count: u32,
        continuation: Option<&str>,
    ) -> CoreResult<StreamPage> {
        if stream_id.is_empty() {
            return Err(CoreError::Validation("stream_id must not be empty".into()));
        }

        let mut query = vec![
            ("n".to_string(), max_count.to_string()),
            ("output".to_string(), "json".to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("c".to_string(), token.to_string()));
        }

        let path = format!("stream/contents/{}", urlencode(stream_id));
        let response = self.call(&path, &query).await?;

        let body: StreamContentsResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("failed to parse stream contents: {e}")))?;

        let now = Utc::now();
        let articles = body
            .items
            .into_iter()
            .filter_map(|item| {
                let url = item
                    .canonical
                    .first()
                    .or_else(|| item.alternate.first())
                    .map(|l| l.href.clone())?;
                let published_at = Utc.timestamp_opt(item.published, 0).single().unwrap_or(now);
                Some(Article {
                    inoreader_id: item.id,
                    subscription_uuid: None,
                    origin_stream_id: item.origin.map(|o| o.stream_id).unwrap_or_default(),
                    title: item.title.unwrap_or_default(),
                    url,
                    published_at,
                    fetched_at: now,
                    content_snippet: item.summary.map(|s| s.content),
                })
            })
            .collect();

        Ok(StreamPage {
            articles,
            next_continuation: body.continuation,
        })
    }

    /// Shared request path: reserve quota, obtain a token, dispatch, and
    /// apply the retry-on-401/fail-on-429/release-on-5xx policy from the
    /// component contract.
    async fn call(&self, path: &str, query: &[(String, String)]) -> CoreResult<reqwest::Response> {
        self.rate_limiter.reserve(1)?;

        let result = self.dispatch(path, query, false).await;

        match result {
            Ok(response) => Ok(response),
            Err(CoreError::AuthRejected(_)) => {
                warn!(path, "gateway received 401, forcing token refresh and retrying once");
                self.token_service.force_refresh().await?;
                match self.dispatch(path, query, true).await {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        if matches!(e, CoreError::Transient(_)) {
                            self.rate_limiter.release(1);
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => {
                if matches!(e, CoreError::Transient(_)) {
                    self.rate_limiter.release(1);
                }
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        path: &str,
        query: &[(String, String)],
        is_retry: bool,
    ) -> CoreResult<reqwest::Response> {
        let token = self.token_service.get_token().await?;
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);

        let response = self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::Transient(format!("gateway request failed: {e}"))
                } else {
                    CoreError::Transient(e.to_string())
                }
            })?;

        let status = response.status();

        if status.as_u16() == 401 {
            if is_retry {
                return Err(CoreError::AuthRejected(
                    "gateway request rejected after token refresh retry".into(),
                ));
            }
            return Err(CoreError::AuthRejected("gateway request unauthorized".into()));
        }

        if status.as_u16() == 429 {
            return Err(CoreError::RateLimited("remote API throttled the request".into()));
        }

        if status.is_server_error() {
            return Err(CoreError::Transient(format!("gateway upstream returned {status}")));
        }

        if !status.is_success() {
            return Err(CoreError::Transient(format!("unexpected gateway status {status}")));
        }

        Ok(response)
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            other => other
                .to_string()
                .into_bytes()
                .iter()
                .map(|b| format!("%{b:02X}"))
                .collect(),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct SubscriptionListResponse {
    #[serde(default, rename = "subscriptions")]
    subscriptions: Vec<RawSubscription>,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    id: String,
    title: String,
    url: String,
    #[serde(rename = "iconUrl", default)]
    icon_url: Option<String>,
    #[serde(default)]
    categories: Vec<RawCategory>,
}

#[derive(Debug, Deserialize)]
struct RawCategory {
    label: String,
}

#[derive(Debug, Deserialize)]
struct StreamContentsResponse {
    #[serde(default)]
    items: Vec<RawItem>,
    #[serde(default)]
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    canonical: Vec<RawLink>,
    #[serde(default)]
    alternate: Vec<RawLink>,
    published: i64,
    #[serde(default)]
    origin: Option<RawOrigin>,
    #[serde(default)]
    summary: Option<RawSummary>,
}

#[derive(Debug, Deserialize)]
struct RawLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct RawOrigin {
    #[serde(rename = "streamId")]
    stream_id: String,
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::store::EnvVarTokenStore;
    use std::sync::Arc;

    async fn make_gateway(base_url: &str) -> (InoreaderGateway, Arc<TokenService>) {
        let store: Arc<dyn crate::token::store::TokenStore> =
            Arc::new(EnvVarTokenStore::new(Some("at".into()), Some("rt".into())));
        let oauth_client = Arc::new(
            crate::token::oauth_client::OAuth2Client::new(base_url, "id", "secret").unwrap(),
        );
        let token_service = Arc::new(TokenService::new(
            store,
            oauth_client,
            std::time::Duration::from_secs(1800),
        ));
        let tuple = crate::models::TokenTuple {
            access_token: "valid-access-token".into(),
            refresh_token: "rt".into(),
            token_type: "Bearer".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            issued_at: Utc::now(),
        };
        token_service.observe_external_change(tuple).await;

        let rate_limiter = Arc::new(RateLimiter::new(100));
        let gateway = InoreaderGateway::new(base_url, None, token_service.clone(), rate_limiter).unwrap();
        (gateway, token_service)
    }

    #[tokio::test]
    async fn list_subscriptions_maps_fields() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/subscription/list")
            .match_header("authorization", "Bearer valid-access-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"subscriptions":[{"id":"feed/1","title":"Example","url":"https://example.com/rss","categories":[{"label":"news"}]}]}"#)
            .create_async()
            .await;

        let (gateway, _token_service) = make_gateway(&server.url()).await;
        let subs = gateway.list_subscriptions().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].inoreader_id, "feed/1");
        assert_eq!(subs[0].category.as_deref(), Some("news"));
    }

    #[tokio::test]
    async fn rate_limited_response_does_not_release_reservation() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/subscription/list")
            .with_status(429)
            .create_async()
            .await;

        let (gateway, _token_service) = make_gateway(&server.url()).await;
        let result = gateway.list_subscriptions().await;
        assert!(matches!(result, Err(CoreError::RateLimited(_))));
    }

    #[tokio::test]
    async fn server_error_releases_reservation() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/subscription/list")
            .with_status(500)
            .create_async()
            .await;

        let (gateway, _token_service) = make_gateway(&server.url()).await;
        let result = gateway.list_subscriptions().await;
        assert!(matches!(result, Err(CoreError::Transient(_))));
    }
}
