//! Delayed-job queue and recurring scheduler.
//!
//! Jobs are rows in the shared database, so they survive restarts. The
//! consumer runs with concurrency 1 and keeps a minimum two-second gap
//! between dequeues; transient failures retry up to three attempts with a
//! 5 s / 10 s / 20 s ladder. Done jobs are evicted after 24 hours, failed
//! jobs after 7 days.
//!
//! Recurring schedules are emitters: each due tick enqueues a fresh job
//! carrying the schedule's payload, then advances `next_run`.

pub mod cron_expr;

pub use cron_expr::{build_expression, ScheduleSpec};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::store::Store;

/// Transient failures retry up to this many total attempts.
const MAX_ATTEMPTS: u32 = 3;

/// Base retry delay; doubles per attempt (5 s, 10 s, 20 s).
const RETRY_BASE_SECS: i64 = 5;

/// Minimum gap between job dequeues.
const DISPATCH_GAP_MS: u64 = 2_000;

/// Poll interval while the queue is idle.
const POLL_MS: u64 = 500;

/// Done jobs are evicted after this long.
const DONE_RETENTION_HOURS: i64 = 24;

/// Failed jobs are kept for inspection this long.
const FAILED_RETENTION_DAYS: i64 = 7;

// ── Payloads ──────────────────────────────────────────────────────

/// Typed job payloads. Payloads carry ids only; the handler re-reads the
/// authoritative record at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    SendIntent { intent_id: String },
    FireRecurrence { rule_id: String },
    RetentionSweep,
}

/// Outcome of one handler execution.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done,
    /// Retryable: socket down, network hiccup.
    Transient(String),
    /// Not worth retrying.
    Fatal(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: &JobPayload) -> JobOutcome;

    /// Called once when a job exhausts its retries or fails fatally.
    async fn on_exhausted(&self, payload: &JobPayload, reason: &str);
}

#[derive(Debug, Clone)]
struct JobRow {
    job_id: String,
    payload: JobPayload,
    attempts: u32,
}

// ── Runtime ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobRuntime {
    store: Store,
}

impl JobRuntime {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // ── Producer side ─────────────────────────────────────────────

    /// Register a job runnable `delay` from now. `job_id` is client-chosen
    /// and deduplicates against jobs still in the queue; returns false when
    /// an equal id is already pending.
    pub fn add_delayed(
        &self,
        job_id: &str,
        payload: &JobPayload,
        delay: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let run_at = now + delay.max(Duration::zero());
        let raw = serde_json::to_string(payload).context("Failed to serialize job payload")?;

        self.store.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT status FROM jobs WHERE job_id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            if matches!(existing.as_deref(), Some("queued" | "running")) {
                return Ok(false);
            }

            conn.execute(
                "INSERT OR REPLACE INTO jobs
                     (job_id, kind, payload, run_at, status, attempts, last_error,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', 0, NULL, ?5, ?5)",
                params![
                    job_id,
                    payload_kind(payload),
                    raw,
                    run_at.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .context("Failed to enqueue job")?;
            Ok(true)
        })
    }

    /// Remove a pending job. No-op when the job is already running or gone.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM jobs WHERE job_id = ?1 AND status = 'queued'",
                    params![job_id],
                )
                .context("Failed to cancel job")?;
            Ok(changed == 1)
        })
    }

    /// Cancel + add under the same id.
    pub fn reschedule(
        &self,
        job_id: &str,
        payload: &JobPayload,
        new_delay: Duration,
    ) -> Result<()> {
        self.cancel(job_id)?;
        self.add_delayed(job_id, payload, new_delay)?;
        Ok(())
    }

    /// Install or replace a recurring emitter.
    pub fn upsert_schedule(
        &self,
        schedule_id: &str,
        spec: &ScheduleSpec,
        end_date: Option<DateTime<Utc>>,
        limit: Option<u32>,
        payload: &JobPayload,
    ) -> Result<()> {
        let now = Utc::now();
        let next_run = spec.next_after(now)?;
        let spec_raw = serde_json::to_string(spec).context("Failed to serialize schedule")?;
        let payload_raw =
            serde_json::to_string(payload).context("Failed to serialize schedule payload")?;

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO schedules
                     (schedule_id, spec, payload, next_run, end_date, remaining,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    schedule_id,
                    spec_raw,
                    payload_raw,
                    next_run.to_rfc3339(),
                    end_date.map(|d| d.to_rfc3339()),
                    limit,
                    now.to_rfc3339()
                ],
            )
            .context("Failed to upsert schedule")?;
            Ok(())
        })
    }

    pub fn remove_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM schedules WHERE schedule_id = ?1",
                    params![schedule_id],
                )
                .context("Failed to remove schedule")?;
            Ok(changed == 1)
        })
    }

    // ── Consumer side ─────────────────────────────────────────────

    /// Main loop. Single consumer; call exactly once.
    pub async fn run(&self, handler: Arc<dyn JobHandler>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.recover_interrupted() {
            tracing::warn!("Job recovery failed: {e:#}");
        }
        tracing::info!("Job runtime started");

        let mut last_evict = Utc::now() - Duration::hours(1);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            if let Err(e) = self.promote_due_schedules(now) {
                tracing::warn!("Schedule promotion failed: {e:#}");
            }

            if now - last_evict > Duration::minutes(1) {
                if let Err(e) = self.evict_old(now) {
                    tracing::warn!("Job eviction failed: {e:#}");
                }
                last_evict = now;
            }

            match self.process_due_job(handler.as_ref(), now).await {
                Ok(true) => {
                    // Rate-gate between dequeues.
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(std::time::Duration::from_millis(DISPATCH_GAP_MS)) => {}
                    }
                }
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(std::time::Duration::from_millis(POLL_MS)) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("Job execution error: {e:#}");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        () = tokio::time::sleep(std::time::Duration::from_millis(POLL_MS)) => {}
                    }
                }
            }
        }
        tracing::info!("Job runtime drained and stopped");
    }

    /// Jobs stuck in `running` from a previous process get re-queued.
    fn recover_interrupted(&self) -> Result<()> {
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'queued', updated_at = ?1 WHERE status = 'running'",
                params![Utc::now().to_rfc3339()],
            )?;
            if changed > 0 {
                tracing::info!("Re-queued {changed} interrupted job(s)");
            }
            Ok(())
        })
    }

    /// Execute at most one due job. Returns whether a job ran.
    pub(crate) async fn process_due_job(
        &self,
        handler: &dyn JobHandler,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(job) = self.claim_due_job(now)? else {
            return Ok(false);
        };

        let outcome = handler.run(&job.payload).await;
        match outcome {
            JobOutcome::Done => self.finish_job(&job.job_id, "done", None)?,
            JobOutcome::Transient(reason) => {
                let attempts = job.attempts + 1;
                if attempts >= MAX_ATTEMPTS {
                    tracing::warn!(
                        "Job {} exhausted {MAX_ATTEMPTS} attempts: {reason}",
                        job.job_id
                    );
                    self.finish_job(&job.job_id, "failed", Some(&reason))?;
                    handler.on_exhausted(&job.payload, &reason).await;
                } else {
                    let delay = Duration::seconds(RETRY_BASE_SECS << (attempts - 1));
                    tracing::info!(
                        "Job {} attempt {attempts} failed ({reason}); retrying in {}s",
                        job.job_id,
                        delay.num_seconds()
                    );
                    self.requeue_for_retry(&job.job_id, attempts, &reason, now + delay)?;
                }
            }
            JobOutcome::Fatal(reason) => {
                tracing::warn!("Job {} failed fatally: {reason}", job.job_id);
                self.finish_job(&job.job_id, "failed", Some(&reason))?;
                handler.on_exhausted(&job.payload, &reason).await;
            }
        }
        Ok(true)
    }

    fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<JobRow>> {
        self.store.with_conn(|conn| {
            let row: Option<(String, String, u32)> = conn
                .query_row(
                    "SELECT job_id, payload, attempts FROM jobs
                     WHERE status = 'queued' AND run_at <= ?1
                     ORDER BY run_at ASC, created_at ASC LIMIT 1",
                    params![now.to_rfc3339()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((job_id, raw, attempts)) = row else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE jobs SET status = 'running', updated_at = ?2 WHERE job_id = ?1",
                params![job_id, now.to_rfc3339()],
            )?;

            let payload: JobPayload = serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt payload for job {job_id}"))?;
            Ok(Some(JobRow {
                job_id,
                payload,
                attempts,
            }))
        })
    }

    fn finish_job(&self, job_id: &str, status: &str, error: Option<&str>) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = ?2, last_error = ?3, updated_at = ?4
                 WHERE job_id = ?1",
                params![job_id, status, error, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn requeue_for_retry(
        &self,
        job_id: &str,
        attempts: u32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs
                 SET status = 'queued', attempts = ?2, last_error = ?3, run_at = ?4,
                     updated_at = ?5
                 WHERE job_id = ?1",
                params![
                    job_id,
                    attempts,
                    error,
                    run_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Enqueue a job for every due schedule and advance it past `now`.
    pub(crate) fn promote_due_schedules(&self, now: DateTime<Utc>) -> Result<()> {
        let due: Vec<(String, String, String, Option<String>, Option<u32>)> =
            self.store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT schedule_id, spec, payload, end_date, remaining FROM schedules
                     WHERE next_run <= ?1",
                )?;
                let rows = stmt
                    .query_map(params![now.to_rfc3339()], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;

        for (schedule_id, spec_raw, payload_raw, end_date_raw, remaining) in due {
            let end_date = match end_date_raw {
                Some(raw) => Some(crate::store::parse_rfc3339(&raw)?),
                None => None,
            };
            if end_date.is_some_and(|end| now > end) {
                tracing::info!("Schedule {schedule_id} passed its end date; removing");
                self.remove_schedule(&schedule_id)?;
                continue;
            }

            let spec: ScheduleSpec = match serde_json::from_str(&spec_raw) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::error!("Corrupt spec for schedule {schedule_id}: {e}; removing");
                    self.remove_schedule(&schedule_id)?;
                    continue;
                }
            };
            let payload: JobPayload = match serde_json::from_str(&payload_raw) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("Corrupt payload for schedule {schedule_id}: {e}; removing");
                    self.remove_schedule(&schedule_id)?;
                    continue;
                }
            };

            let job_id = format!("{schedule_id}@{}", Uuid::new_v4());
            self.add_delayed(&job_id, &payload, Duration::zero())?;

            let exhausted = match remaining {
                Some(left) => {
                    let left = left.saturating_sub(1);
                    if left == 0 {
                        true
                    } else {
                        self.store.with_conn(|conn| {
                            conn.execute(
                                "UPDATE schedules SET remaining = ?2, updated_at = ?3
                                 WHERE schedule_id = ?1",
                                params![schedule_id, left, now.to_rfc3339()],
                            )?;
                            Ok(())
                        })?;
                        false
                    }
                }
                None => false,
            };
            if exhausted {
                tracing::info!("Schedule {schedule_id} hit its firing limit; removing");
                self.remove_schedule(&schedule_id)?;
                continue;
            }

            match spec.next_after(now) {
                Ok(next_run) => {
                    self.store.with_conn(|conn| {
                        conn.execute(
                            "UPDATE schedules SET next_run = ?2, updated_at = ?3
                             WHERE schedule_id = ?1",
                            params![schedule_id, next_run.to_rfc3339(), now.to_rfc3339()],
                        )?;
                        Ok(())
                    })?;
                }
                Err(e) => {
                    tracing::error!("Schedule {schedule_id} has no next occurrence: {e}; removing");
                    self.remove_schedule(&schedule_id)?;
                }
            }
        }
        Ok(())
    }

    /// Drop done jobs past 24 h and failed jobs past 7 days.
    pub(crate) fn evict_old(&self, now: DateTime<Utc>) -> Result<()> {
        let done_cutoff = now - Duration::hours(DONE_RETENTION_HOURS);
        let failed_cutoff = now - Duration::days(FAILED_RETENTION_DAYS);
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM jobs WHERE status = 'done' AND updated_at < ?1",
                params![done_cutoff.to_rfc3339()],
            )?;
            conn.execute(
                "DELETE FROM jobs WHERE status = 'failed' AND updated_at < ?1",
                params![failed_cutoff.to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

fn payload_kind(payload: &JobPayload) -> &'static str {
    match payload {
        JobPayload::SendIntent { .. } => "send_intent",
        JobPayload::FireRecurrence { .. } => "fire_recurrence",
        JobPayload::RetentionSweep => "retention_sweep",
    }
}
