//! C4 — Rate-Limit Ledger: a UTC-calendar-day API quota. Deliberately
//! hand-rolled rather than built on a leaky-bucket/token-bucket crate
//! (`governor` elsewhere in this workspace's sibling services models a
//! continuous refill rate; Inoreader's contract is a hard daily count that
//! resets at UTC midnight, a different shape that a refill-rate crate would
//! only approximate).

use chrono::{NaiveDate, Utc};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::RateLimitState;

pub struct RateLimiter {
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                day_bucket: Utc::now().date_naive(),
                used_count: 0,
                daily_limit,
                zone: "all".to_string(),
            }),
        }
    }

    fn roll_if_new_day(state: &mut RateLimitState) {
        let today = Utc::now().date_naive();
        if state.day_bucket != today {
            info!(previous_used = state.used_count, "rate limit ledger rolled over to new UTC day");
            state.day_bucket = today;
            state.used_count = 0;
        }
    }

    /// Reserve `n` units of quota. Fails with `BudgetExhausted` without
    /// mutating state if the reservation would exceed the daily limit.
    pub fn reserve(&self, n: u32) -> CoreResult<()> {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        Self::roll_if_new_day(&mut state);

        if state.used_count.saturating_add(n) > state.daily_limit {
            warn!(used = state.used_count, limit = state.daily_limit, requested = n, "rate limit budget exhausted");
            return Err(CoreError::BudgetExhausted);
        }

        state.used_count += n;
        Ok(())
    }

    /// Release `n` previously reserved units, e.g. after a call fails before
    /// it actually consumed remote quota. Never releases past zero and never
    /// crosses a day boundary backwards.
    pub fn release(&self, n: u32) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        Self::roll_if_new_day(&mut state);
        state.used_count = state.used_count.saturating_sub(n);
    }

    pub fn snapshot(&self) -> RateLimitState {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        Self::roll_if_new_day(&mut state);
        state.clone()
    }

    /// Force the ledger onto a specific day bucket; used only by tests that
    /// need to simulate a rollover without sleeping past midnight.
    #[cfg(test)]
    pub fn set_day_bucket_for_test(&self, day: NaiveDate) {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        state.day_bucket = day;
    }
}
