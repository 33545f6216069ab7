//! Recurring schedule specifications.
//!
//! Rule kinds map onto 6-field cron expressions (seconds first), except
//! `custom` which is a plain every-N-days interval. Monthly rules whose day
//! falls past the 28th use the `L` day-of-month sentinel; the cron crate
//! has no notion of `L`, so those schedules resolve the actual last day of
//! the month at evaluation time.
//!
//! All schedules evaluate in IST (fixed +05:30): the product's day is the
//! IST day, so "daily at 9" means 09:00 IST.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::store::{RecurrenceRule, RuleKind};

fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("IST offset is valid")
}

// ── Expression synthesis ──────────────────────────────────────────

/// Cron expression for a rule kind firing at `hour:minute`.
/// `day`, `month`, `day_of_week` are used by the kinds that need them.
pub fn build_expression(
    kind: RuleKind,
    minute: u32,
    hour: u32,
    day: Option<u32>,
    month: Option<u32>,
    day_of_week: Option<u32>,
) -> Result<String> {
    anyhow::ensure!(minute < 60, "minute out of range: {minute}");
    anyhow::ensure!(hour < 24, "hour out of range: {hour}");

    match kind {
        RuleKind::Daily => Ok(format!("0 {minute} {hour} * * *")),
        RuleKind::Weekly => {
            let dow = day_of_week.context("weekly rule needs a day of week")?;
            anyhow::ensure!(dow <= 6, "day of week out of range: {dow}");
            // Callers speak 0-6 (Sunday first); the cron crate numbers days
            // 1-7, so emit names instead.
            const DAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
            Ok(format!("0 {minute} {hour} * * {}", DAYS[dow as usize]))
        }
        RuleKind::Monthly => {
            let day = day.context("monthly rule needs a day of month")?;
            anyhow::ensure!((1..=31).contains(&day), "day of month out of range: {day}");
            // Days past the 28th don't exist in every month; fire on the
            // actual last day instead.
            if day > 28 {
                Ok(format!("0 {minute} {hour} L * *"))
            } else {
                Ok(format!("0 {minute} {hour} {day} * *"))
            }
        }
        RuleKind::Yearly | RuleKind::Birthday => {
            let day = day.context("yearly rule needs a day")?;
            let month = month.context("yearly rule needs a month")?;
            anyhow::ensure!((1..=31).contains(&day), "day out of range: {day}");
            anyhow::ensure!((1..=12).contains(&month), "month out of range: {month}");
            Ok(format!("0 {minute} {hour} {day} {month} *"))
        }
        RuleKind::Custom => anyhow::bail!("custom rules use an interval, not a cron expression"),
    }
}

// ── Evaluation ────────────────────────────────────────────────────

/// Persisted form of a recurring schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Cron { expr: String },
    EveryDays { days: u32, minute: u32, hour: u32 },
}

impl ScheduleSpec {
    /// Persisted schedule form for a recurrence rule.
    pub fn for_rule(rule: &RecurrenceRule, default_hour: u32) -> Result<Self> {
        if rule.kind.uses_interval() {
            let days = rule
                .every_n_days
                .context("custom rule is missing its interval")?;
            anyhow::ensure!(days > 0, "interval must be at least one day");
            Ok(Self::EveryDays {
                days,
                minute: 0,
                hour: default_hour,
            })
        } else {
            let expr = rule
                .cron_expression
                .clone()
                .context("rule is missing its cron expression")?;
            Ok(Self::Cron { expr })
        }
    }

    /// Next fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Cron { expr } => next_cron_occurrence(expr, after),
            Self::EveryDays { days, minute, hour } => {
                let local = (after.with_timezone(&ist()) + Duration::days(i64::from(*days)))
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .context("invalid interval fire time")?;
                let fire = ist()
                    .from_local_datetime(&local)
                    .single()
                    .context("ambiguous interval fire time")?;
                Ok(fire.with_timezone(&Utc))
            }
        }
    }
}

fn next_cron_occurrence(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    anyhow::ensure!(
        fields.len() == 6,
        "Invalid cron expression: {expr} (expected 6 fields, got {})",
        fields.len()
    );

    // Last-day-of-month sentinel: resolve by hand, month by month.
    if fields[3] == "L" {
        let minute: u32 = fields[1].parse().context("invalid minute field")?;
        let hour: u32 = fields[2].parse().context("invalid hour field")?;
        return next_last_day_occurrence(minute, hour, after);
    }

    let schedule = Schedule::from_str(expr)
        .with_context(|| format!("Invalid cron expression: {expr}"))?;
    let after_ist = after.with_timezone(&ist());
    schedule
        .after(&after_ist)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expr}"))
}

pub(crate) fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_y, next_m, 1)
        .expect("first of month is always valid")
        .pred_opt()
        .expect("day before first of month exists")
        .day()
}

fn next_last_day_occurrence(
    minute: u32,
    hour: u32,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let after_ist = after.with_timezone(&ist());
    let mut year = after_ist.year();
    let mut month = after_ist.month();

    // The candidate this month may already be behind us; at most the second
    // iteration produces a future instant.
    for _ in 0..2 {
        let day = last_day_of_month(year, month);
        let local = NaiveDate::from_ymd_opt(year, month, day)
            .context("invalid last-day date")?
            .and_hms_opt(hour, minute, 0)
            .context("invalid last-day fire time")?;
        let fire = ist()
            .from_local_datetime(&local)
            .single()
            .context("ambiguous last-day fire time")?
            .with_timezone(&Utc);
        if fire > after {
            return Ok(fire);
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    anyhow::bail!("No future last-day occurrence after {after}")
}
