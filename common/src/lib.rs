/*!
common/src/lib.rs

Shared, domain-agnostic helpers used by the sidecar binary:
- a generic TOML config loader that merges a default file with an optional
  override file
- SQLite pool initialization and migration helpers
*/

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration section shared by every service in the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/pre-processor-sidecar.db")
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    5
}

/// Load a TOML-deserializable config from a default file merged with an
/// optional override file (override wins on a per-key basis). Either path
/// may be absent.
pub async fn load_toml_with_defaults<T: DeserializeOwned>(
    default_path: Option<&Path>,
    override_path: Option<&Path>,
) -> Result<T> {
    let mut config_value = toml::Value::Table(toml::map::Map::new());

    if let Some(path) = default_path {
        if path.exists() {
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read default config: {}", path.display()))?;
            let val: toml::Value =
                toml::from_str(&data).context("Failed to parse default configuration")?;
            merge_toml(&mut config_value, val);
        }
    }

    if let Some(path) = override_path {
        if path.exists() {
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read override config: {}", path.display()))?;
            let val: toml::Value =
                toml::from_str(&data).context("Failed to parse override configuration")?;
            merge_toml(&mut config_value, val);
        }
    }

    let cfg: T = config_value
        .try_into()
        .context("Failed to parse merged configuration")?;
    Ok(cfg)
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations using sqlx's migration macro against the given pool.
/// Expects a `migrations` directory alongside the workspace root.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;
    Ok(())
}

/// Initialize an SQLite connection pool, creating the parent directory and
/// the database file if missing.
pub async fn init_db_pool(path: &str, db_config: &DatabaseConfig) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Convenience sleep helper, kept for callers that want a testable delay seam.
pub async fn sleep_millis(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
