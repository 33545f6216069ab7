//! Retention sweeping.
//!
//! A recurring job (daily at 03:00) deletes terminal intents whose
//! `sent_at` is older than the retention window. `retention_days = 0`
//! disables the sweep entirely. Pending and cancelled rows are never
//! touched: pending rows still have work to do, cancelled rows carry no
//! `sent_at`.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::jobs::{JobPayload, JobRuntime, ScheduleSpec};
use crate::store::{IntentStatus, Store};

/// Schedule id for the daily sweep.
pub const SWEEP_SCHEDULE_ID: &str = "retention-sweep";

/// Statuses eligible for sweeping.
const SWEPT: [IntentStatus; 3] = [
    IntentStatus::Sent,
    IntentStatus::Delivered,
    IntentStatus::Failed,
];

/// Install (or remove) the daily sweep schedule.
pub fn register(runtime: &JobRuntime, retention_days: u32) -> Result<()> {
    if retention_days == 0 {
        runtime.remove_schedule(SWEEP_SCHEDULE_ID)?;
        tracing::info!("Retention sweeping disabled");
        return Ok(());
    }
    runtime.upsert_schedule(
        SWEEP_SCHEDULE_ID,
        &ScheduleSpec::Cron {
            expr: "0 0 3 * * *".into(),
        },
        None,
        None,
        &JobPayload::RetentionSweep,
    )?;
    tracing::info!("Retention sweep scheduled daily at 03:00 ({retention_days}-day window)");
    Ok(())
}

/// One sweep pass. Returns the number of rows removed.
pub fn sweep(store: &Store, retention_days: u32) -> Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    store.delete_terminal_older_than(cutoff, &SWEPT)
}
