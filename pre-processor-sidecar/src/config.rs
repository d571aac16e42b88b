//! Configuration loading.
//!
//! Secrets and per-deployment endpoints come from environment variables
//! (the table in the design's "Environment configuration" section); operator
//! tunables that are safe to commit (schedule periods, the daily budget, the
//! admin port) are layered from an optional TOML file on top of built-in
//! defaults, the same default-then-override merge `common::load_toml_with_defaults`
//! provides for the rest of the platform.

use anyhow::{Context, Result};
use common::DatabaseConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStorageType {
    KubernetesSecret,
    EnvVar,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_subscription_sync_period_minutes")]
    pub subscription_sync_period_minutes: i64,
    #[serde(default = "default_rotation_interval_minutes")]
    pub rotation_interval_minutes: i64,
    #[serde(default = "default_startup_delay_seconds")]
    pub startup_delay_seconds: u64,
}

fn default_subscription_sync_period_minutes() -> i64 {
    12 * 60
}

fn default_rotation_interval_minutes() -> i64 {
    30
}

fn default_startup_delay_seconds() -> u64 {
    10
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            subscription_sync_period_minutes: default_subscription_sync_period_minutes(),
            rotation_interval_minutes: default_rotation_interval_minutes(),
            startup_delay_seconds: default_startup_delay_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

fn default_daily_limit() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default = "default_admin_rate_limit_per_hour")]
    pub rate_limit_per_hour: u32,
}

fn default_admin_port() -> u16 {
    8080
}

fn default_admin_rate_limit_per_hour() -> u32 {
    5
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: default_admin_port(),
            rate_limit_per_hour: default_admin_rate_limit_per_hour(),
        }
    }
}

/// File-loadable, committable tunables. Everything secret or
/// environment-specific lives in `Config` proper, sourced from env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TunablesFile {
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct OAuth2Settings {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub refresh_buffer: Duration,
}

#[derive(Debug, Clone)]
pub struct TokenStoreSettings {
    pub storage_type: TokenStorageType,
    pub secret_name: String,
    pub namespace: String,
    pub enable_secret_watch: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub oauth2: OAuth2Settings,
    pub inoreader_base_url: String,
    pub token_store: TokenStoreSettings,
    pub bootstrap_access_token: Option<String>,
    pub bootstrap_refresh_token: Option<String>,
    pub https_proxy: Option<String>,
    pub admin_bearer_token: String,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
    pub rate_limit: RateLimitConfig,
    pub admin: AdminConfig,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> Result<String> {
    env_opt(key).with_context(|| format!("missing required environment variable {key}"))
}

impl Config {
    /// Load tunables from an optional default/override TOML pair, then
    /// layer environment variables (secrets, endpoints, storage selection)
    /// on top. Mirrors the platform's `Config::load_with_defaults` merge
    /// order, but secrets never live in the TOML files.
    pub async fn load(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let tunables: TunablesFile =
            common::load_toml_with_defaults(default_path, override_path).await?;

        let storage_type = match env_opt("TOKEN_STORAGE_TYPE").as_deref() {
            Some("kubernetes_secret") => TokenStorageType::KubernetesSecret,
            Some("env_var") | None => TokenStorageType::EnvVar,
            Some(other) => anyhow::bail!("unrecognized TOKEN_STORAGE_TYPE: {other}"),
        };

        let refresh_buffer_minutes: u64 = env_opt("OAUTH2_TOKEN_REFRESH_BUFFER")
            .map(|v| v.parse())
            .transpose()
            .context("OAUTH2_TOKEN_REFRESH_BUFFER must be an integer number of minutes")?
            .unwrap_or(30);

        let daily_limit = env_opt("ROTATION_API_BUDGET")
            .or_else(|| env_opt("SUBSCRIPTIONS_PER_DAY"))
            .map(|v| v.parse())
            .transpose()
            .context("ROTATION_API_BUDGET/SUBSCRIPTIONS_PER_DAY must be an integer")?
            .unwrap_or(tunables.rate_limit.daily_limit);

        let rotation_interval_minutes = env_opt("ROTATION_INTERVAL_MINUTES")
            .map(|v| v.parse())
            .transpose()
            .context("ROTATION_INTERVAL_MINUTES must be an integer")?
            .unwrap_or(tunables.schedule.rotation_interval_minutes);

        let database = tunables.database.unwrap_or(DatabaseConfig {
            path: "data/pre-processor-sidecar.db".to_string(),
            max_connections: 25,
            min_connections: 5,
        });

        Ok(Self {
            oauth2: OAuth2Settings {
                client_id: env_required("INOREADER_CLIENT_ID")?,
                client_secret: env_required("INOREADER_CLIENT_SECRET")?,
                base_url: env_opt("OAUTH2_BASE_URL")
                    .unwrap_or_else(|| "https://www.inoreader.com/oauth2".to_string()),
                refresh_buffer: Duration::from_secs(refresh_buffer_minutes * 60),
            },
            inoreader_base_url: env_opt("INOREADER_BASE_URL")
                .unwrap_or_else(|| "https://www.inoreader.com/reader/api/0".to_string()),
            token_store: TokenStoreSettings {
                storage_type,
                secret_name: env_opt("OAUTH2_SECRET_NAME")
                    .unwrap_or_else(|| "inoreader-oauth2-token".to_string()),
                namespace: env_opt("KUBERNETES_NAMESPACE").unwrap_or_else(|| "default".to_string()),
                enable_secret_watch: env_opt("ENABLE_SECRET_WATCH")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false),
            },
            bootstrap_access_token: env_opt("INOREADER_ACCESS_TOKEN"),
            bootstrap_refresh_token: env_opt("INOREADER_REFRESH_TOKEN"),
            https_proxy: env_opt("HTTPS_PROXY"),
            admin_bearer_token: env_opt("ADMIN_BEARER_TOKEN").unwrap_or_else(|| {
                tracing::warn!(
                    "ADMIN_BEARER_TOKEN not set; generating an ephemeral credential for this process"
                );
                uuid::Uuid::new_v4().to_string()
            }),
            database,
            schedule: ScheduleConfig {
                rotation_interval_minutes,
                ..tunables.schedule
            },
            rate_limit: RateLimitConfig { daily_limit },
            admin: tunables.admin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunables_file_defaults_are_sane() {
        let tunables = TunablesFile::default();
        assert_eq!(tunables.schedule.rotation_interval_minutes, 30);
        assert_eq!(tunables.schedule.subscription_sync_period_minutes, 720);
        assert_eq!(tunables.rate_limit.daily_limit, 100);
        assert_eq!(tunables.admin.port, 8080);
    }
}
