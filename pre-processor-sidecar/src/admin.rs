//! C12 — Admin Surface: a small authenticated HTTP control plane over C3
//! and C11. Every route requires a bearer credential (mounted from the
//! orchestrator, not a user-facing login), is rate-limited per credential,
//! and validates request bodies before they reach any component.

use chrono::Utc;
use rocket::data::{Limits, ToByteUnit};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, post, routes, Build, Rocket, State};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::CoreError;
use crate::models::TokenStatus;
use crate::scheduler::ScheduleHandler;
use crate::token::service::TokenService;

const MAX_BODY_BYTES: u64 = 16 * 1024;

pub struct AdminState {
    pub token_service: Arc<TokenService>,
    pub scheduler: Arc<ScheduleHandler>,
    pub bearer_token: String,
    pub rate_limit_per_hour: u32,
    pub credential_ledger: Mutex<HashMap<String, (Instant, u32)>>,
}

impl AdminState {
    pub fn new(
        token_service: Arc<TokenService>,
        scheduler: Arc<ScheduleHandler>,
        bearer_token: String,
        rate_limit_per_hour: u32,
    ) -> Self {
        Self {
            token_service,
            scheduler,
            bearer_token,
            rate_limit_per_hour,
            credential_ledger: Mutex::new(HashMap::new()),
        }
    }

    async fn check_rate_limit(&self, credential: &str) -> bool {
        let mut ledger = self.credential_ledger.lock().await;
        let entry = ledger
            .entry(credential.to_string())
            .or_insert_with(|| (Instant::now(), 0));

        if entry.0.elapsed() >= Duration::from_secs(3600) {
            *entry = (Instant::now(), 0);
        }

        if entry.1 >= self.rate_limit_per_hour {
            return false;
        }

        entry.1 += 1;
        true
    }
}

#[derive(Serialize)]
struct Envelope<T> {
    status: &'static str,
    message: String,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "ok",
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
            data: Some(data),
        }
    }
}

impl Envelope<()> {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
            data: None,
        }
    }
}

/// Authenticated admin credential, extracted from the `Authorization: Bearer
/// <token>` header and checked against the configured static secret and the
/// per-credential rate limiter.
pub struct AdminCredential {
    token: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminCredential {
    type Error = Json<Envelope<()>>;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let state = match req.guard::<&State<AdminState>>().await {
            Outcome::Success(state) => state,
            _ => {
                return Outcome::Error((
                    Status::InternalServerError,
                    Json(Envelope::error("admin state not configured")),
                ))
            }
        };

        let header = req.headers().get_one("Authorization");
        let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                return Outcome::Error((
                    Status::Unauthorized,
                    Json(Envelope::error("missing or malformed Authorization header")),
                ))
            }
        };

        if token != state.bearer_token {
            return Outcome::Error((
                Status::Unauthorized,
                Json(Envelope::error("invalid admin credential")),
            ));
        }

        if !state.check_rate_limit(&token).await {
            warn!("admin credential exceeded its hourly request budget");
            return Outcome::Error((
                Status::TooManyRequests,
                Json(Envelope::error("rate limit exceeded for this credential")),
            ));
        }

        Outcome::Success(AdminCredential { token })
    }
}

fn contains_control_characters(s: &str) -> bool {
    s.chars().any(|c| c.is_control() && c != '\n' && c != '\t')
}

#[derive(Deserialize)]
pub struct RotateRefreshTokenRequest {
    refresh_token: String,
}

fn validate_rotate_request(body: &RotateRefreshTokenRequest) -> Result<(), String> {
    if body.refresh_token.trim().is_empty() {
        return Err("refresh_token must not be empty".to_string());
    }
    if body.refresh_token.len() > 4096 {
        return Err("refresh_token exceeds maximum length".to_string());
    }
    if contains_control_characters(&body.refresh_token) {
        return Err("refresh_token contains control characters".to_string());
    }
    Ok(())
}

#[post("/admin/oauth2/refresh-token", data = "<body>")]
async fn rotate_refresh_token(
    _credential: AdminCredential,
    state: &State<AdminState>,
    body: Json<RotateRefreshTokenRequest>,
) -> Result<Json<Envelope<TokenStatus>>, (Status, Json<Envelope<()>>)> {
    if let Err(message) = validate_rotate_request(&body) {
        return Err((Status::BadRequest, Json(Envelope::error(message))));
    }

    match state
        .token_service
        .rotate_refresh_token(body.into_inner().refresh_token)
        .await
    {
        Ok(_) => {
            let status = state.token_service.status().await;
            Ok(Json(Envelope::ok("refresh token rotated", status)))
        }
        Err(e) => Err(core_error_response(e)),
    }
}

#[get("/admin/oauth2/token-status")]
async fn token_status(
    _credential: AdminCredential,
    state: &State<AdminState>,
) -> Json<Envelope<TokenStatus>> {
    let status = state.token_service.status().await;
    Json(Envelope::ok("token status", status))
}

#[post("/admin/trigger/article-fetch")]
async fn trigger_article_fetch(
    _credential: AdminCredential,
    state: &State<AdminState>,
) -> Result<Json<Envelope<()>>, (Status, Json<Envelope<()>>)> {
    state
        .scheduler
        .trigger_article_fetch()
        .await
        .map(|_| Json(Envelope::ok("article fetch triggered", ())))
        .map_err(core_error_response)
}

#[post("/admin/trigger/subscription-sync")]
async fn trigger_subscription_sync(
    _credential: AdminCredential,
    state: &State<AdminState>,
) -> Result<Json<Envelope<()>>, (Status, Json<Envelope<()>>)> {
    state
        .scheduler
        .trigger_subscription_sync()
        .await
        .map(|_| Json(Envelope::ok("subscription sync triggered", ())))
        .map_err(core_error_response)
}

fn core_error_response<T>(e: CoreError) -> (Status, Json<Envelope<T>>) {
    let (status, message) = match &e {
        CoreError::Validation(_) => (Status::BadRequest, e.to_string()),
        CoreError::AuthRejected(_) => (Status::Unauthorized, e.to_string()),
        CoreError::Unavailable(_) => (Status::ServiceUnavailable, e.to_string()),
        CoreError::Conflict(_) => (Status::Conflict, e.to_string()),
        CoreError::RateLimited(_) | CoreError::BudgetExhausted => {
            (Status::TooManyRequests, e.to_string())
        }
        _ => (Status::InternalServerError, e.to_string()),
    };
    (
        status,
        Json(Envelope::error(message).into()),
    )
}

impl<T> From<Envelope<()>> for Envelope<T> {
    fn from(e: Envelope<()>) -> Self {
        Envelope {
            status: e.status,
            message: e.message,
            timestamp: e.timestamp,
            data: None,
        }
    }
}

pub fn build_rocket(state: AdminState, port: u16) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("port", port))
        .merge(("limits", Limits::new().limit("json", MAX_BODY_BYTES.bytes())));

    rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![
                rotate_refresh_token,
                token_status,
                trigger_article_fetch,
                trigger_subscription_sync,
            ],
        )
}
