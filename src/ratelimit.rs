//! Daily send cap.
//!
//! Counts are always computed from the store, never cached: the count of
//! intents whose `sent_at` falls inside the current IST day with status
//! sent or delivered. IST is a fixed +05:30 offset with no DST, so the day
//! boundary is pure arithmetic: shift forward 5h30m, truncate to the day,
//! shift back.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::events::{BusEvent, EventBus};
use crate::store::Store;

/// IST offset from UTC in minutes.
const IST_OFFSET_MIN: i64 = 5 * 60 + 30;

/// The current IST day as a UTC instant range `[start, start + 24h)`.
pub fn ist_day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let shifted = now + Duration::minutes(IST_OFFSET_MIN);
    let day_start = shifted
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    let start = day_start - Duration::minutes(IST_OFFSET_MIN);
    (start, start + Duration::hours(24))
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStatus {
    pub sent_today: u32,
    pub daily_cap: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub warning: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CapCheck {
    pub allowed: bool,
    pub sent_today: u32,
    pub daily_cap: u32,
    pub remaining: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    bus: EventBus,
    daily_cap: u32,
    warn_pct: u32,
}

impl RateLimiter {
    pub fn new(store: Store, bus: EventBus, daily_cap: u32, warn_pct: u32) -> Self {
        // The cap cannot be disabled; a zero config value is a mistake, not
        // an opt-out.
        let daily_cap = daily_cap.max(1);
        Self {
            store,
            bus,
            daily_cap,
            warn_pct,
        }
    }

    pub fn daily_cap(&self) -> u32 {
        self.daily_cap
    }

    fn sent_today(&self, now: DateTime<Utc>) -> Result<u32> {
        let (start, end) = ist_day_bounds(now);
        self.store.count_terminal_success_in(start, end)
    }

    pub fn can_send(&self) -> Result<CapCheck> {
        let sent_today = self.sent_today(Utc::now())?;
        Ok(CapCheck {
            allowed: sent_today < self.daily_cap,
            sent_today,
            daily_cap: self.daily_cap,
            remaining: self.daily_cap.saturating_sub(sent_today),
        })
    }

    pub fn status(&self) -> Result<RateStatus> {
        let now = Utc::now();
        let sent_today = self.sent_today(now)?;
        let (_, reset_at) = ist_day_bounds(now);
        Ok(RateStatus {
            sent_today,
            daily_cap: self.daily_cap,
            remaining: self.daily_cap.saturating_sub(sent_today),
            reset_at,
            warning: sent_today >= self.warn_threshold(),
        })
    }

    /// Called after each dispatch attempt. Fires the warning on every send
    /// at or above the threshold, and the reached event at the cap.
    pub fn check_and_warn(&self) -> Result<()> {
        let now = Utc::now();
        let sent_today = self.sent_today(now)?;

        if sent_today >= self.daily_cap {
            let (_, reset_at) = ist_day_bounds(now);
            self.bus.emit(&BusEvent::RateLimitReached {
                sent_today,
                cap: self.daily_cap,
                reset_at,
            });
            tracing::warn!(
                "Daily message cap reached ({sent_today}/{})",
                self.daily_cap
            );
        } else if sent_today >= self.warn_threshold() {
            self.bus.emit(&BusEvent::RateLimitWarning {
                sent_today,
                cap: self.daily_cap,
                remaining: self.daily_cap - sent_today,
            });
            tracing::info!(
                "Approaching daily message cap ({sent_today}/{})",
                self.daily_cap
            );
        }
        Ok(())
    }

    fn warn_threshold(&self) -> u32 {
        self.daily_cap * self.warn_pct / 100
    }
}
