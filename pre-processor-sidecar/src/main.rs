//! pre-processor-sidecar - single-binary process supervisor.
//! Starts the token service (C3), the dual schedule loops (C11), and the
//! admin HTTP surface (C12) as independent tasks joined by one root
//! cancellation token.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use rand::Rng;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pre_processor_sidecar::admin::{build_rocket, AdminState};
use pre_processor_sidecar::config::{Config, TokenStorageType};
use pre_processor_sidecar::fetch_service::ArticleFetchService;
use pre_processor_sidecar::gateway::InoreaderGateway;
use pre_processor_sidecar::rate_limit::RateLimiter;
use pre_processor_sidecar::repository::{ArticleRepository, SubscriptionRepository, SyncStateRepository};
use pre_processor_sidecar::resolver::UuidResolver;
use pre_processor_sidecar::scheduler::ScheduleHandler;
use pre_processor_sidecar::sync_service::SubscriptionSyncService;
use pre_processor_sidecar::token::oauth_client::OAuth2Client;
use pre_processor_sidecar::token::service::TokenService;
use pre_processor_sidecar::token::store::build_token_store;

#[derive(Parser, Debug)]
#[command(name = "pre-processor-sidecar", about = "Inoreader ingestion sidecar")]
struct Args {
    /// Path to config.toml (operational tunables override file)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

const DB_PING_RETRIES: u32 = 3;
const DB_PING_BACKOFF: Duration = Duration::from_secs(5);

/// Confirms the pool can actually serve a query before migrations run,
/// retrying a transient connection failure with jittered backoff rather
/// than failing the whole process on the first blip.
async fn wait_for_db_ready(pool: &SqlitePool) -> Result<()> {
    let mut attempt = 0;
    loop {
        match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < DB_PING_RETRIES => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..500);
                let delay = DB_PING_BACKOFF + Duration::from_millis(jitter);
                warn!(attempt, error = %e, "database not yet reachable, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("database still unreachable after retries"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = match args.config {
        Some(p) if p.exists() => Some(p),
        Some(p) => {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("config file not found: {}", p.display()));
        }
        None => {
            let p = PathBuf::from("config.toml");
            p.exists().then_some(p)
        }
    };

    let config = Config::load(
        default_path.exists().then_some(default_path.as_path()),
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!("configuration loaded");

    let db_pool = common::init_db_pool(&config.database.path, &config.database)
        .await
        .context("failed to initialize database pool")?;
    wait_for_db_ready(&db_pool)
        .await
        .context("database did not become ready")?;
    common::run_migrations(&db_pool)
        .await
        .context("failed to run database migrations")?;
    info!("database ready");

    let kube_client = if config.token_store.storage_type == TokenStorageType::KubernetesSecret {
        Some(Arc::new(
            Client::try_default()
                .await
                .context("failed to construct kubernetes client for token store")?,
        ))
    } else {
        None
    };

    let token_store = build_token_store(
        kube_client,
        &config.token_store,
        config.bootstrap_access_token.clone(),
        config.bootstrap_refresh_token.clone(),
    )?;

    let oauth_client = Arc::new(OAuth2Client::new(
        config.oauth2.base_url.clone(),
        config.oauth2.client_id.clone(),
        config.oauth2.client_secret.clone(),
    )?);

    let token_service = Arc::new(TokenService::new(
        token_store.clone(),
        oauth_client,
        config.oauth2.refresh_buffer,
    ));
    token_service
        .bootstrap()
        .await
        .context("token service failed to bootstrap")?;

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.daily_limit));

    let gateway = Arc::new(InoreaderGateway::new(
        config.inoreader_base_url.clone(),
        config.https_proxy.clone(),
        token_service.clone(),
        rate_limiter,
    )?);

    let subscription_repo = Arc::new(SubscriptionRepository::new(db_pool.clone()));
    let article_repo = Arc::new(ArticleRepository::new(db_pool.clone()));
    let sync_state_repo = Arc::new(SyncStateRepository::new(db_pool.clone()));
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
        Duration::from_secs(config.schedule.subscription_sync_period_minutes as u64 * 60),
        Duration::from_secs(config.schedule.rotation_interval_minutes as u64 * 60),
        Duration::from_secs(config.schedule.startup_delay_seconds),
    ));
    scheduler
        .register_observer(Box::new(|result| {
            if result.success {
                info!(job_type = ?result.job_type, duration_ms = result.duration_ms, "job completed");
            } else {
                warn!(job_type = ?result.job_type, duration_ms = result.duration_ms, error = ?result.error, "job failed");
            }
        }))
        .await;

    let root_cancel = CancellationToken::new();

    let mut join_set = tokio::task::JoinSet::new();

    join_set.spawn({
        let scheduler = scheduler.clone();
        let cancel = root_cancel.clone();
        async move {
            scheduler.run_sync_loop(cancel).await;
        }
    });

    join_set.spawn({
        let scheduler = scheduler.clone();
        let cancel = root_cancel.clone();
        async move {
            scheduler.run_fetch_loop(cancel).await;
        }
    });

    if config.token_store.enable_secret_watch {
        if let Some(mut watch_rx) = token_store.watch() {
            join_set.spawn({
                let token_service = token_service.clone();
                let cancel = root_cancel.clone();
                async move {
                    loop {
                        tokio::select! {
                            Some(tuple) = watch_rx.recv() => {
                                token_service.observe_external_change(tuple).await;
                            }
                            _ = cancel.cancelled() => break,
                            else => break,
                        }
                    }
                }
            });
        }
    }

    join_set.spawn({
        let token_service = token_service.clone();
        let cancel = root_cancel.clone();
        async move {
            loop {
                let delay = token_service.next_proactive_refresh_delay().await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = token_service.force_refresh().await {
                            warn!(error = %e, "proactive token refresh failed");
                            let backoff = token_service.recovery_backoff_delay().await;
                            tokio::time::sleep(backoff).await;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }
    });

    let admin_state = AdminState::new(
        token_service,
        scheduler,
        config.admin_bearer_token.clone(),
        config.admin.rate_limit_per_hour,
    );
    let rocket = build_rocket(admin_state, config.admin.port)
        .ignite()
        .await
        .context("failed to ignite admin http server")?;
    let rocket_shutdown_handle = rocket.shutdown();

    join_set.spawn(async move {
        if let Err(e) = rocket.launch().await {
            error!(%e, "admin http server failed");
        }
    });

    join_set.spawn({
        let cancel = root_cancel.clone();
        async move {
            cancel.cancelled().await;
            rocket_shutdown_handle.notify();
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    root_cancel.cancel();

    match tokio::time::timeout(Duration::from_secs(30), async {
        while join_set.join_next().await.is_some() {}
    })
    .await
    {
        Ok(_) => info!("all tasks stopped cleanly"),
        Err(_) => warn!("shutdown grace period elapsed; exiting anyway"),
    }

    Ok(())
}
