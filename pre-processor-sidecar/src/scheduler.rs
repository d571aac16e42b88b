//! C11 — Schedule Handler: two independent, concurrent loops (subscription
//! sync, article fetch), each enforcing non-overlap. A tick that arrives
//! while the previous invocation is still running is coalesced — dropped,
//! not queued — and logged. Manual triggers from C12 use the same
//! single-flight guard but fail loudly with `AlreadyRunning` instead.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::fetch_service::ArticleFetchService;
use crate::models::{JobResult, JobType};
use crate::sync_service::SubscriptionSyncService;

type JobObserver = Box<dyn Fn(JobResult) + Send + Sync>;

/// Guards a single job kind: `running` is the fast non-blocking check used
/// to coalesce ticks and reject manual triggers; `execution` serializes the
/// actual job body.
struct JobGuard {
    running: AtomicBool,
    execution: Mutex<()>,
}

impl JobGuard {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            execution: Mutex::new(()),
        }
    }

    fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct ScheduleHandler {
    sync_service: Arc<SubscriptionSyncService>,
    fetch_service: Arc<ArticleFetchService>,
    sync_guard: Arc<JobGuard>,
    fetch_guard: Arc<JobGuard>,
    observers: Mutex<Vec<JobObserver>>,
    sync_period: Duration,
    fetch_period: Duration,
    startup_delay: Duration,
}

impl ScheduleHandler {
    pub fn new(
        sync_service: Arc<SubscriptionSyncService>,
        fetch_service: Arc<ArticleFetchService>,
        sync_period: Duration,
        fetch_period: Duration,
        startup_delay: Duration,
    ) -> Self {
        Self {
            sync_service,
            fetch_service,
            sync_guard: Arc::new(JobGuard::new()),
            fetch_guard: Arc::new(JobGuard::new()),
            observers: Mutex::new(Vec::new()),
            sync_period,
            fetch_period,
            startup_delay,
        }
    }

    pub async fn register_observer(&self, observer: JobObserver) {
        self.observers.lock().await.push(observer);
    }

    async fn emit(&self, result: JobResult) {
        let observers = self.observers.lock().await;
        for observer in observers.iter() {
            observer(result.clone());
        }
    }

    /// Runs the subscription-sync loop until `cancel` fires. Honors the
    /// startup delay, coalesces overlapping ticks, completes any in-flight
    /// run before returning on cancellation.
    pub async fn run_sync_loop(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            _ = cancel.cancelled() => return,
        }

        let mut ticker = tokio::time::interval(self.sync_period);
        ticker.tick().await; // first tick fires immediately; consume it, we already waited for startup_delay

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_sync_once().await;
                }
                _ = cancel.cancelled() => {
                    info!("subscription sync loop cancelled");
                    return;
                }
            }
        }
    }

    pub async fn run_fetch_loop(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            _ = cancel.cancelled() => return,
        }

        let mut ticker = tokio::time::interval(self.fetch_period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_fetch_once().await;
                }
                _ = cancel.cancelled() => {
                    info!("article fetch loop cancelled");
                    return;
                }
            }
        }
    }

    async fn run_sync_once(&self) {
        if !self.sync_guard.try_begin() {
            warn!("subscription sync tick coalesced: previous run still in flight");
            return;
        }
        let _permit = self.sync_guard.execution.lock().await;

        let started_at = Utc::now();
        let outcome = self.sync_service.sync().await;
        let result = JobResult {
            job_type: JobType::SubscriptionSync,
            success: outcome.is_ok(),
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
            error: outcome.err().map(|e| e.to_string()),
        };
        self.sync_guard.end();
        self.emit(result).await;
    }

    async fn run_fetch_once(&self) {
        if !self.fetch_guard.try_begin() {
            warn!("article fetch tick coalesced: previous run still in flight");
            return;
        }
        let _permit = self.fetch_guard.execution.lock().await;

        let started_at = Utc::now();
        let outcome = self.fetch_service.fetch_next_stream().await;
        let result = JobResult {
            job_type: JobType::ArticleFetch,
            success: outcome.is_ok(),
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
            error: outcome.err().map(|e| e.to_string()),
        };
        self.fetch_guard.end();
        self.emit(result).await;
    }

    /// Manual trigger from C12. Fails with `Conflict` rather than
    /// coalescing silently if the job is already running.
    pub async fn trigger_subscription_sync(&self) -> CoreResult<()> {
        if !self.sync_guard.try_begin() {
            return Err(CoreError::Conflict("subscription sync already running".into()));
        }
        let _permit = self.sync_guard.execution.lock().await;

        let started_at = Utc::now();
        let outcome = self.sync_service.sync().await;
        let result = JobResult {
            job_type: JobType::SubscriptionSync,
            success: outcome.is_ok(),
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        self.sync_guard.end();
        self.emit(result).await;
        outcome.map(|_| ())
    }

    pub async fn trigger_article_fetch(&self) -> CoreResult<()> {
        if !self.fetch_guard.try_begin() {
            return Err(CoreError::Conflict("article fetch already running".into()));
        }
        let _permit = self.fetch_guard.execution.lock().await;

        let started_at = Utc::now();
        let outcome = self.fetch_service.fetch_next_stream().await;
        let result = JobResult {
            job_type: JobType::ArticleFetch,
            success: outcome.is_ok(),
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        self.fetch_guard.end();
        self.emit(result).await;
        outcome.map(|_| ())
    }
}
