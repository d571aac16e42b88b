//! C3 — Token Service: the sole authority on "what is the current valid
//! token". Guarantees at most one in-flight refresh, atomic publication of
//! the new tuple, proactive refresh ahead of expiry, and a bounded-backoff
//! recovery mode on persistent failure.
//!
//! The single-flight discipline is grounded on the same shared-state idiom
//! the platform uses for its own process-wide `Notify`: one `Mutex`-guarded
//! slot holds either the current tuple or an in-progress refresh future that
//! every concurrent caller awaits, so exactly one `OAuth2Client::refresh`
//! call is ever in flight at a time.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{error, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::{TokenStatus, TokenTuple};
use crate::token::oauth_client::OAuth2Client;
use crate::token::store::TokenStore;

/// Freshness check margin: a token is still usable if it has at least this
/// much life left, independent of the proactive refresh buffer.
const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Ceiling on the recovery-mode backoff, so `consecutive_failures` never
/// translates into an unbounded wait (open question in the design, resolved
/// here at 15 minutes).
const RECOVERY_BACKOFF_CEILING: Duration = Duration::from_secs(15 * 60);
const RECOVERY_BACKOFF_INITIAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Bootstrap,
    Ready,
    Recovery,
}

struct Inner {
    state: State,
    tuple: Option<TokenTuple>,
    consecutive_failures: u32,
    last_refresh_at: Option<DateTime<Utc>>,
}

/// Single source of truth for the current access token.
pub struct TokenService {
    store: Arc<dyn TokenStore>,
    oauth_client: Arc<OAuth2Client>,
    refresh_buffer: Duration,
    inner: RwLock<Inner>,
    /// Serializes refresh attempts: whoever acquires this lock performs the
    /// actual network call; everyone else just awaits its release and then
    /// re-reads `inner`.
    refresh_gate: Mutex<()>,
    refresh_calls: std::sync::atomic::AtomicU64,
    invalidated: Notify,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        oauth_client: Arc<OAuth2Client>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            store,
            oauth_client,
            refresh_buffer,
            inner: RwLock::new(Inner {
                state: State::Bootstrap,
                tuple: None,
                consecutive_failures: 0,
                last_refresh_at: None,
            }),
            refresh_gate: Mutex::new(()),
            refresh_calls: std::sync::atomic::AtomicU64::new(0),
            invalidated: Notify::new(),
        }
    }

    /// Number of times `OAuth2Client::refresh` has actually been invoked.
    /// Exposed for tests asserting single-flight behavior.
    pub fn refresh_call_count(&self) -> u64 {
        self.refresh_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Load the initial tuple from the store, entering `ready` on success or
    /// `recovery` (if a tuple already exists nowhere, `bootstrap` stays put
    /// until the first successful refresh) on failure.
    pub async fn bootstrap(&self) -> CoreResult<()> {
        match self.store.load().await {
            Ok(tuple) if tuple.is_well_formed() => {
                let mut inner = self.inner.write().await;
                inner.tuple = Some(tuple);
                inner.state = State::Ready;
                info!("token service bootstrap: loaded existing tuple from store");
                Ok(())
            }
            Ok(tuple) => {
                warn!("token service bootstrap: stored tuple is malformed, forcing refresh");
                // Keep whatever refresh token the malformed tuple carries so
                // force_refresh has something to exchange; an access token
                // isn't required to bootstrap.
                self.inner.write().await.tuple = Some(tuple);
                self.force_refresh().await.map(|_| ())
            }
            Err(CoreError::NotFound(_)) => {
                info!("token service bootstrap: no stored tuple, attempting initial refresh");
                self.force_refresh().await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Return the current tuple if it has at least `SAFETY_MARGIN` of life
    /// left; otherwise perform (or await) a refresh.
    pub async fn get_token(&self) -> CoreResult<TokenTuple> {
        {
            let inner = self.inner.read().await;
            if let Some(tuple) = &inner.tuple {
                let now = Utc::now();
                if tuple.expires_at > now + chrono::Duration::from_std(SAFETY_MARGIN).unwrap() {
                    return Ok(tuple.clone());
                }
                if tuple.expires_at <= now && inner.state == State::Recovery {
                    return Err(CoreError::Unavailable(
                        "token expired and recovery mode has not yet obtained a fresh one".into(),
                    ));
                }
            }
        }
        self.force_refresh().await
    }

    /// Unconditionally refresh, ignoring whether the current tuple still
    /// looks fresh — used by `rotate_refresh_token`, by the gateway's
    /// 401-triggered recovery, and by `get_token` when the tuple is stale.
    /// The `refresh_gate` mutex serializes concurrent callers so at most one
    /// `OAuth2Client::refresh` call is ever in flight at a time; it does not
    /// short-circuit callers onto a cached result, since the whole point of
    /// calling this method is that the cached tuple cannot be trusted.
    pub async fn force_refresh(&self) -> CoreResult<TokenTuple> {
        let _gate = self.refresh_gate.lock().await;

        let refresh_token = {
            let inner = self.inner.read().await;
            inner
                .tuple
                .as_ref()
                .map(|t| t.refresh_token.clone())
        };

        let refresh_token = match refresh_token {
            Some(rt) => rt,
            None => self.bootstrap_refresh_token().await?,
        };

        self.refresh_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        match self.oauth_client.refresh(&refresh_token).await {
            Ok(new_tuple) => {
                self.store.save(&new_tuple).await?;
                let mut inner = self.inner.write().await;
                inner.tuple = Some(new_tuple.clone());
                inner.state = State::Ready;
                inner.consecutive_failures = 0;
                inner.last_refresh_at = Some(Utc::now());
                Ok(new_tuple)
            }
            Err(e @ CoreError::AuthRejected(_)) => {
                let mut inner = self.inner.write().await;
                inner.state = State::Recovery;
                inner.consecutive_failures += 1;
                error!(failures = inner.consecutive_failures, "oauth2 refresh rejected, entering recovery");
                Err(e)
            }
            Err(e) => {
                let mut inner = self.inner.write().await;
                inner.consecutive_failures += 1;
                if inner.state == State::Ready {
                    inner.state = State::Recovery;
                }
                warn!(failures = inner.consecutive_failures, error = %e, "token refresh failed, remaining in recovery");
                Err(e)
            }
        }
    }

    /// Replace the refresh token atomically, persist it, then force a
    /// refresh so the access token is known-good before returning.
    pub async fn rotate_refresh_token(&self, new_refresh_token: String) -> CoreResult<TokenTuple> {
        {
            let mut inner = self.inner.write().await;
            let now = Utc::now();
            inner.tuple = Some(match inner.tuple.take() {
                Some(mut tuple) => {
                    tuple.refresh_token = new_refresh_token;
                    tuple
                }
                None => TokenTuple {
                    access_token: String::new(),
                    refresh_token: new_refresh_token,
                    token_type: "Bearer".to_string(),
                    expires_at: now,
                    issued_at: now,
                },
            });
        }

        let rotated = {
            let inner = self.inner.read().await;
            inner.tuple.clone().expect("tuple was just set")
        };
        self.store.save(&rotated).await?;
        self.invalidated.notify_waiters();

        self.force_refresh().await
    }

    pub async fn status(&self) -> TokenStatus {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let (is_valid, expires_in_seconds) = match &inner.tuple {
            Some(tuple) => (
                tuple.expires_at > now,
                (tuple.expires_at - now).num_seconds().max(0),
            ),
            None => (false, 0),
        };

        TokenStatus {
            is_valid,
            expires_in_seconds,
            is_refreshing: self.refresh_gate.try_lock().is_err(),
            last_refresh_at: inner.last_refresh_at,
            consecutive_failures: inner.consecutive_failures,
            is_in_recovery_mode: inner.state == State::Recovery,
        }
    }

    /// How long to sleep before the proactive refresh timer should fire
    /// next, based on the current tuple's expiry and the configured buffer.
    pub async fn next_proactive_refresh_delay(&self) -> Duration {
        let inner = self.inner.read().await;
        match &inner.tuple {
            Some(tuple) => {
                let target = tuple.expires_at - chrono::Duration::from_std(self.refresh_buffer).unwrap();
                let now = Utc::now();
                if target <= now {
                    Duration::ZERO
                } else {
                    (target - now).to_std().unwrap_or(Duration::ZERO)
                }
            }
            None => Duration::ZERO,
        }
    }

    /// Backoff delay for the current `consecutive_failures` count, doubling
    /// up to `RECOVERY_BACKOFF_CEILING`.
    pub async fn recovery_backoff_delay(&self) -> Duration {
        let failures = self.inner.read().await.consecutive_failures;
        let multiplier = 1u64.checked_shl(failures.min(16)).unwrap_or(u64::MAX);
        RECOVERY_BACKOFF_INITIAL
            .checked_mul(multiplier as u32)
            .unwrap_or(RECOVERY_BACKOFF_CEILING)
            .min(RECOVERY_BACKOFF_CEILING)
    }

    /// Invoked by the optional secret-watch loop when the backing store
    /// reports an externally-applied change.
    pub async fn observe_external_change(&self, tuple: TokenTuple) {
        info!("applying externally observed token change");
        let mut inner = self.inner.write().await;
        inner.tuple = Some(tuple);
        inner.state = State::Ready;
        inner.consecutive_failures = 0;
        drop(inner);
        self.invalidated.notify_waiters();
    }

    /// Called when `force_refresh` finds no in-memory tuple at all (fresh
    /// process, or a previous load genuinely found nothing): fall back to
    /// whatever the backing store currently holds rather than failing
    /// outright, since the store may carry a refresh token this instance
    /// never loaded into `inner` (e.g. a concurrent `force_refresh` racing
    /// `bootstrap`).
    async fn bootstrap_refresh_token(&self) -> CoreResult<String> {
        let tuple = self.store.load().await?;
        if tuple.refresh_token.is_empty() {
            return Err(CoreError::Internal(
                "stored tuple has no refresh token to bootstrap from".into(),
            ));
        }
        Ok(tuple.refresh_token)
    }
}
