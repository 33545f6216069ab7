//! The dispatcher: single consumer of the job runtime.
//!
//! Every outgoing message funnels through here, one at a time. The flow per
//! send: re-read the authoritative intent, check the daily cap, resolve the
//! address, require a live socket, send, commit the status flip, emit, then
//! idle a random interval so the account keeps a human-looking cadence.
//!
//! Dispatch errors never propagate to a caller; they end up as intent
//! mutations and bus events.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;

use crate::chat::{contact_address, group_address, OutgoingPayload, SendError};
use crate::config::PacingConfig;
use crate::connection::ConnectionManager;
use crate::contacts::ContactStore;
use crate::events::{BusEvent, EventBus};
use crate::jobs::{JobHandler, JobOutcome, JobPayload, JobRuntime};
use crate::ratelimit::RateLimiter;
use crate::retention;
use crate::store::{Intent, IntentStatus, Recipient, Store};

/// Job id used for an intent's send job; shared with the scheduling service
/// so edits and cancels target the same row.
pub fn intent_job_id(intent_id: &str) -> String {
    format!("intent-{intent_id}")
}

pub struct Dispatcher {
    store: Store,
    contacts: Arc<dyn ContactStore>,
    limiter: RateLimiter,
    connection: Arc<ConnectionManager>,
    runtime: JobRuntime,
    bus: EventBus,
    pacing: PacingConfig,
    retention_days: u32,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        contacts: Arc<dyn ContactStore>,
        limiter: RateLimiter,
        connection: Arc<ConnectionManager>,
        runtime: JobRuntime,
        bus: EventBus,
        pacing: PacingConfig,
        retention_days: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            contacts,
            limiter,
            connection,
            runtime,
            bus,
            pacing,
            retention_days,
        })
    }

    // ── Send flow ─────────────────────────────────────────────────

    async fn dispatch_intent(&self, intent_id: &str) -> JobOutcome {
        let intent = match self.store.find_intent(intent_id) {
            Ok(Some(intent)) => intent,
            // Tombstoned: the row is gone, nothing to do.
            Ok(None) => return JobOutcome::Done,
            Err(e) => return JobOutcome::Transient(format!("intent load failed: {e:#}")),
        };

        if intent.status != IntentStatus::Pending {
            tracing::debug!(
                "Skipping intent {} in terminal status {}",
                intent.id,
                intent.status.as_str()
            );
            return JobOutcome::Done;
        }

        // Cap check happens at dispatch time, against the store.
        match self.limiter.can_send() {
            Ok(check) if !check.allowed => {
                let reason = format!(
                    "Daily message cap reached ({}/{})",
                    check.sent_today, check.daily_cap
                );
                self.fail_intent(&intent, &reason);
                let _ = self.limiter.check_and_warn();
                return JobOutcome::Done;
            }
            Ok(_) => {}
            Err(e) => return JobOutcome::Transient(format!("cap check failed: {e:#}")),
        }

        let address = match self.resolve_address(&intent) {
            Ok(address) => address,
            Err(e) => return JobOutcome::Fatal(e.to_string()),
        };

        let Some(socket) = self.connection.get_socket() else {
            return JobOutcome::Transient("chat socket not connected".into());
        };

        let payload = OutgoingPayload::build(&intent.content, intent.media.as_ref());
        let provider_id = match socket.send(&address, &payload).await {
            Ok(id) => id,
            Err(SendError::NotConnected) => {
                return JobOutcome::Transient("chat socket not connected".into())
            }
            Err(SendError::Transient(reason)) => return JobOutcome::Transient(reason),
            Err(SendError::Fatal(reason)) => return JobOutcome::Fatal(reason),
        };

        let sent_at = Utc::now();
        match self.store.mark_intent_sent(&intent.id, &provider_id, sent_at) {
            Ok(true) => {
                tracing::info!("Intent {} sent as {provider_id}", intent.id);
                self.bus.emit(&BusEvent::IntentSent {
                    intent_id: intent.id.clone(),
                    provider_message_id: provider_id,
                    sent_at,
                });
                if let Err(e) = self.limiter.check_and_warn() {
                    tracing::warn!("Rate warn check failed: {e:#}");
                }
            }
            // A cancel committed while the send was in flight. The message
            // left anyway (at-least-once); the row keeps its terminal state.
            Ok(false) => {
                tracing::warn!(
                    "Intent {} reached a terminal state mid-send; keeping it",
                    intent.id
                );
            }
            Err(e) => {
                tracing::error!("Failed to record send for intent {}: {e:#}", intent.id);
            }
        }

        self.pace().await;
        JobOutcome::Done
    }

    fn resolve_address(&self, intent: &Intent) -> Result<String> {
        match &intent.recipient {
            Recipient::Group(group_id) => Ok(group_address(group_id)),
            Recipient::Contact(contact_id) => {
                let contact = self
                    .contacts
                    .find_contact(contact_id)?
                    .ok_or_else(|| anyhow::anyhow!("contact {contact_id} not found"))?;
                Ok(contact_address(&contact.phone))
            }
        }
    }

    fn fail_intent(&self, intent: &Intent, reason: &str) {
        match self.store.mark_intent_failed(&intent.id, reason) {
            Ok(true) => {
                tracing::warn!("Intent {} failed: {reason}", intent.id);
                self.bus.emit(&BusEvent::IntentFailed {
                    intent_id: intent.id.clone(),
                    reason: reason.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to mark intent {} failed: {e:#}", intent.id),
        }
    }

    /// Human-cadence idle between sends: uniform in `[min, max)`.
    async fn pace(&self) {
        let min = self.pacing.min_delay_ms;
        let max = self.pacing.max_delay_ms.max(min + 1);
        let ms = rand::thread_rng().gen_range(min..max);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    // ── Recurrence firing ─────────────────────────────────────────

    fn fire_recurrence(&self, rule_id: &str) -> JobOutcome {
        let rule = match self.store.find_rule(rule_id) {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                tracing::info!("Recurrence rule {rule_id} is gone; dropping firing");
                return JobOutcome::Done;
            }
            Err(e) => return JobOutcome::Transient(format!("rule load failed: {e:#}")),
        };

        let now = Utc::now();
        if !rule.enabled || rule.exhausted(now) {
            tracing::debug!("Rule {} disabled or exhausted; not firing", rule.id);
            return JobOutcome::Done;
        }

        let mut intent = Intent::new(
            Recipient::Contact(rule.contact_id.clone()),
            rule.content.clone(),
            rule.media.clone(),
            now,
        );
        intent.recurrence_rule_id = Some(rule.id.clone());

        if let Err(e) = self.store.record_rule_firing(&rule, &intent, now) {
            return JobOutcome::Transient(format!("rule firing failed: {e:#}"));
        }

        // The send itself runs as its own job so its retries can't duplicate
        // the intent row.
        if let Err(e) = self.runtime.add_delayed(
            &intent_job_id(&intent.id),
            &JobPayload::SendIntent {
                intent_id: intent.id.clone(),
            },
            Duration::zero(),
        ) {
            tracing::error!("Failed to enqueue send for fired rule {}: {e:#}", rule.id);
        }
        tracing::info!("Rule {} fired intent {}", rule.id, intent.id);
        JobOutcome::Done
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn run(&self, payload: &JobPayload) -> JobOutcome {
        match payload {
            JobPayload::SendIntent { intent_id } => self.dispatch_intent(intent_id).await,
            JobPayload::FireRecurrence { rule_id } => self.fire_recurrence(rule_id),
            JobPayload::RetentionSweep => {
                match retention::sweep(&self.store, self.retention_days) {
                    Ok(removed) => {
                        if removed > 0 {
                            tracing::info!("Retention sweep removed {removed} intent(s)");
                        }
                        JobOutcome::Done
                    }
                    Err(e) => JobOutcome::Transient(format!("retention sweep failed: {e:#}")),
                }
            }
        }
    }

    async fn on_exhausted(&self, payload: &JobPayload, reason: &str) {
        match payload {
            JobPayload::SendIntent { intent_id } => {
                if let Ok(Some(intent)) = self.store.find_intent(intent_id) {
                    if intent.status == IntentStatus::Pending {
                        self.fail_intent(&intent, reason);
                        if let Err(e) = self.limiter.check_and_warn() {
                            tracing::warn!("Rate warn check failed: {e:#}");
                        }
                    }
                }
            }
            JobPayload::FireRecurrence { rule_id } => {
                tracing::error!("Recurrence firing for rule {rule_id} gave up: {reason}");
            }
            JobPayload::RetentionSweep => {
                tracing::error!("Retention sweep gave up: {reason}");
            }
        }
    }
}
