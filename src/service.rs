//! Scheduling service: the typed public surface.
//!
//! Translates user requests into persisted intents plus job-runtime
//! registrations, and owns recurrence rules end to end. Any transport can
//! sit in front of this; errors come back as [`ServiceError`] variants, not
//! status codes.

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::RecurrenceConfig;
use crate::contacts::ContactStore;
use crate::dispatch::intent_job_id;
use crate::error::ServiceError;
use crate::jobs::{build_expression, JobPayload, JobRuntime, ScheduleSpec};
use crate::ratelimit::{RateLimiter, RateStatus};
use crate::store::{
    Intent, IntentFilter, IntentStatus, MediaKind, MediaRef, RecurrenceRule, Recipient, RuleKind,
    Store,
};
use crate::store::intents::IntentPatch;
use crate::store::rules::RulePatch;

/// Hard ceiling on one bulk request.
const MAX_BATCH: usize = 500;

/// Substituted into the birthday template when the contact has no name.
const NAME_FALLBACK: &str = "friend";

fn rule_schedule_id(rule_id: &str) -> String {
    format!("rule-{rule_id}")
}

// ── Request / response types ──────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduleRequest {
    pub contact_id: Option<String>,
    pub phone: Option<String>,
    /// Optional display name, used when auto-creating a contact by phone.
    pub name: Option<String>,
    pub group_id: Option<String>,
    #[serde(default)]
    pub content: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug)]
pub struct ScheduleOutcome {
    pub intent: Intent,
    pub rate_limit: RateStatus,
}

#[derive(Debug)]
pub struct BulkOutcome {
    pub scheduled: Vec<Intent>,
    pub failed: Vec<BulkFailure>,
    pub rate_limit: RateStatus,
}

#[derive(Debug)]
pub struct BulkFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EditRequest {
    pub content: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListQuery {
    pub status: Option<String>,
    pub contact_id: Option<String>,
    pub phone: Option<String>,
    /// "include" (default) or "exclude".
    pub phone_mode: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateRuleRequest {
    pub contact_id: Option<String>,
    pub phone: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub content: String,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    /// Fire time; the configured default send hour applies when absent.
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    /// Day of month for monthly/yearly kinds.
    pub day: Option<u32>,
    /// Month for yearly kinds.
    pub month: Option<u32>,
    /// 0-6 for weekly kinds.
    pub day_of_week: Option<u32>,
    /// Interval for custom kinds.
    pub every_n_days: Option<u32>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateRuleRequest {
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<u32>,
    pub every_n_days: Option<u32>,
    pub enabled: Option<bool>,
}

// ── Service ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SchedulingService {
    store: Store,
    contacts: Arc<dyn ContactStore>,
    limiter: RateLimiter,
    runtime: JobRuntime,
    recurrence: RecurrenceConfig,
}

impl SchedulingService {
    pub fn new(
        store: Store,
        contacts: Arc<dyn ContactStore>,
        limiter: RateLimiter,
        runtime: JobRuntime,
        recurrence: RecurrenceConfig,
    ) -> Self {
        Self {
            store,
            contacts,
            limiter,
            runtime,
            recurrence,
        }
    }

    // ── Intents ───────────────────────────────────────────────────

    pub fn schedule(&self, req: &ScheduleRequest) -> Result<ScheduleOutcome, ServiceError> {
        let recipient = self.resolve_recipient(req)?;
        let media = parse_media(req.media_url.as_deref(), req.media_type.as_deref())?;
        if req.content.trim().is_empty() && media.is_none() {
            return Err(ServiceError::bad_request(
                "content is required when no media is attached",
            ));
        }

        let now = Utc::now();
        let scheduled_at = req.scheduled_at.unwrap_or(now);
        let immediate = scheduled_at <= now;

        // Immediate sends fail fast at the cap; future sends are checked at
        // dispatch time instead.
        if immediate {
            let check = self.limiter.can_send().map_err(ServiceError::Internal)?;
            if !check.allowed {
                return Err(ServiceError::DailyCapReached(
                    self.limiter.status().map_err(ServiceError::Internal)?,
                ));
            }
        }

        let intent = Intent::new(recipient, req.content.trim().to_string(), media, scheduled_at);
        self.store
            .insert_intent(&intent)
            .map_err(ServiceError::Internal)?;

        let delay = (scheduled_at - now).max(Duration::zero());
        self.runtime
            .add_delayed(
                &intent_job_id(&intent.id),
                &JobPayload::SendIntent {
                    intent_id: intent.id.clone(),
                },
                delay,
            )
            .map_err(ServiceError::Internal)?;

        tracing::info!(
            "Scheduled intent {} ({})",
            intent.id,
            if immediate { "immediate" } else { "future" }
        );
        Ok(ScheduleOutcome {
            intent,
            rate_limit: self.limiter.status().map_err(ServiceError::Internal)?,
        })
    }

    pub fn schedule_bulk(&self, items: &[ScheduleRequest]) -> Result<BulkOutcome, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::bad_request("empty batch"));
        }
        if items.len() > MAX_BATCH {
            return Err(ServiceError::bad_request(format!(
                "batch size {} exceeds the {MAX_BATCH}-item limit",
                items.len()
            )));
        }

        // The whole batch fails fast when the immediate portion cannot fit
        // in today's remaining capacity.
        let now = Utc::now();
        let immediate_count = items
            .iter()
            .filter(|item| item.scheduled_at.is_none_or(|at| at <= now))
            .count();
        let check = self.limiter.can_send().map_err(ServiceError::Internal)?;
        if immediate_count > check.remaining as usize {
            return Err(ServiceError::DailyCapReached(
                self.limiter.status().map_err(ServiceError::Internal)?,
            ));
        }

        // Per-item failures don't abort the rest.
        let mut scheduled = Vec::new();
        let mut failed = Vec::new();
        for (index, item) in items.iter().enumerate() {
            match self.schedule(item) {
                Ok(outcome) => scheduled.push(outcome.intent),
                Err(e) => failed.push(BulkFailure {
                    index,
                    error: e.to_string(),
                }),
            }
        }

        Ok(BulkOutcome {
            scheduled,
            failed,
            rate_limit: self.limiter.status().map_err(ServiceError::Internal)?,
        })
    }

    pub fn get(&self, id: &str) -> Result<Intent, ServiceError> {
        self.store
            .find_intent(id)
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::not_found(format!("intent {id}")))
    }

    pub fn list(&self, query: &ListQuery) -> Result<Vec<Intent>, ServiceError> {
        let status = query
            .status
            .as_deref()
            .map(IntentStatus::try_from)
            .transpose()
            .map_err(|e| ServiceError::bad_request(e.to_string()))?;
        let phone_mode = match query.phone_mode.as_deref() {
            None | Some("include") => crate::store::PhoneMode::Include,
            Some("exclude") => crate::store::PhoneMode::Exclude,
            Some(other) => {
                return Err(ServiceError::bad_request(format!(
                    "phoneMode must be include or exclude, got '{other}'"
                )))
            }
        };
        if query.limit.is_some_and(|l| l > 200) {
            return Err(ServiceError::bad_request("limit must be at most 200"));
        }

        let filter = IntentFilter {
            status,
            contact_id: query.contact_id.clone(),
            phone: query.phone.as_deref().map(crate::contacts::normalize_phone),
            phone_mode,
            limit: query.limit.unwrap_or(50),
            offset: query.offset.unwrap_or(0),
        };
        self.store.list_intents(&filter).map_err(ServiceError::Internal)
    }

    pub fn edit(&self, id: &str, req: &EditRequest) -> Result<Intent, ServiceError> {
        let existing = self.get(id)?;
        if existing.status != IntentStatus::Pending {
            return Err(ServiceError::conflict(format!(
                "intent {id} is {}, only pending intents can be edited",
                existing.status.as_str()
            )));
        }

        let media = match (&req.media_url, &req.media_type) {
            (None, None) => None,
            (url, kind) => Some(Some(
                parse_media(url.as_deref(), kind.as_deref())?
                    .context("media edit requires both url and type")
                    .map_err(|e| ServiceError::bad_request(e.to_string()))?,
            )),
        };

        let patch = IntentPatch {
            content: req.content.clone(),
            scheduled_at: req.scheduled_at,
            media,
        };
        let updated = self
            .store
            .update_pending_intent(id, &patch)
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::conflict(format!("intent {id} is no longer pending")))?;

        // A moved fire time means the delayed job moves with it.
        if let Some(at) = req.scheduled_at {
            let delay = (at - Utc::now()).max(Duration::zero());
            self.runtime
                .reschedule(
                    &intent_job_id(id),
                    &JobPayload::SendIntent {
                        intent_id: id.to_string(),
                    },
                    delay,
                )
                .map_err(ServiceError::Internal)?;
        }
        Ok(updated)
    }

    /// Atomic cancel. Returns `None` when the intent exists but is no
    /// longer pending (idempotent).
    pub fn cancel(&self, id: &str) -> Result<Option<Intent>, ServiceError> {
        // Distinguish missing from non-pending for the caller.
        self.get(id)?;
        let cancelled = self
            .store
            .cancel_intent(id)
            .map_err(ServiceError::Internal)?;
        if cancelled.is_some() {
            // Best effort: an in-flight job no-ops on the terminal row.
            let _ = self.runtime.cancel(&intent_job_id(id));
        }
        Ok(cancelled)
    }

    pub fn retry(&self, id: &str) -> Result<Intent, ServiceError> {
        let existing = self.get(id)?;
        if existing.status != IntentStatus::Failed {
            return Err(ServiceError::conflict(format!(
                "intent {id} is {}, only failed intents can be retried",
                existing.status.as_str()
            )));
        }

        let retried = self
            .store
            .retry_intent(id, Utc::now())
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::conflict(format!("intent {id} is no longer failed")))?;

        self.runtime
            .reschedule(
                &intent_job_id(id),
                &JobPayload::SendIntent {
                    intent_id: id.to_string(),
                },
                Duration::zero(),
            )
            .map_err(ServiceError::Internal)?;
        Ok(retried)
    }

    // ── Recurrence rules ──────────────────────────────────────────

    pub fn create_rule(&self, req: &CreateRuleRequest) -> Result<RecurrenceRule, ServiceError> {
        let contact = self.resolve_rule_contact(req.contact_id.as_deref(), req.phone.as_deref())?;
        let kind = RuleKind::try_from(req.kind.as_str())
            .map_err(|e| ServiceError::bad_request(e.to_string()))?;
        let media = parse_media(req.media_url.as_deref(), req.media_type.as_deref())?;
        if req.content.trim().is_empty() && media.is_none() {
            return Err(ServiceError::bad_request(
                "content is required when no media is attached",
            ));
        }

        let mut rule = RecurrenceRule::new(contact, kind, req.content.trim().to_string());
        rule.media = media;
        rule.end_date = req.end_date;
        rule.max_occurrences = req.max_occurrences;

        let hour = req.hour.unwrap_or(self.recurrence.default_send_hour);
        let minute = req.minute.unwrap_or(0);
        if kind.uses_interval() {
            let days = req
                .every_n_days
                .ok_or_else(|| ServiceError::bad_request("custom rules need everyNDays"))?;
            if days == 0 {
                return Err(ServiceError::bad_request("everyNDays must be positive"));
            }
            rule.every_n_days = Some(days);
        } else {
            let expr = build_expression(kind, minute, hour, req.day, req.month, req.day_of_week)
                .map_err(|e| ServiceError::bad_request(e.to_string()))?;
            rule.cron_expression = Some(expr);
        }

        self.store.insert_rule(&rule).map_err(|e| {
            // The partial unique index guards birthday rules.
            if e.to_string().contains("UNIQUE") {
                ServiceError::conflict("a birthday rule already exists for this contact")
            } else {
                ServiceError::Internal(e)
            }
        })?;
        self.register_rule_schedule(&rule)?;
        tracing::info!("Created {} rule {}", rule.kind.as_str(), rule.id);
        Ok(rule)
    }

    pub fn get_rule(&self, id: &str) -> Result<RecurrenceRule, ServiceError> {
        self.store
            .find_rule(id)
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::not_found(format!("rule {id}")))
    }

    pub fn list_rules(&self, contact_id: Option<&str>) -> Result<Vec<RecurrenceRule>, ServiceError> {
        self.store
            .list_rules(contact_id)
            .map_err(ServiceError::Internal)
    }

    pub fn update_rule(
        &self,
        id: &str,
        req: &UpdateRuleRequest,
    ) -> Result<RecurrenceRule, ServiceError> {
        let existing = self.get_rule(id)?;

        let media = match (&req.media_url, &req.media_type) {
            (None, None) => None,
            (url, kind) => Some(Some(
                parse_media(url.as_deref(), kind.as_deref())?
                    .context("media edit requires both url and type")
                    .map_err(|e| ServiceError::bad_request(e.to_string()))?,
            )),
        };
        if req.every_n_days.is_some() && !existing.kind.uses_interval() {
            return Err(ServiceError::bad_request(
                "everyNDays only applies to custom rules",
            ));
        }

        let patch = RulePatch {
            content: req.content.clone(),
            media,
            cron_expression: None,
            every_n_days: req.every_n_days.map(Some),
            end_date: req.end_date.map(Some),
            max_occurrences: req.max_occurrences.map(Some),
            enabled: req.enabled,
        };
        let updated = self
            .store
            .update_rule(id, &patch)
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::not_found(format!("rule {id}")))?;

        // Re-register the emitter against the updated rule, or drop it when
        // the rule got turned off.
        if updated.enabled {
            self.register_rule_schedule(&updated)?;
        } else {
            self.runtime
                .remove_schedule(&rule_schedule_id(id))
                .map_err(ServiceError::Internal)?;
        }
        Ok(updated)
    }

    /// Soft-delete: the rule survives for history but never fires again.
    pub fn disable_rule(&self, id: &str) -> Result<(), ServiceError> {
        let disabled = self
            .store
            .disable_rule(id)
            .map_err(ServiceError::Internal)?;
        if !disabled {
            return Err(ServiceError::not_found(format!("rule {id}")));
        }
        self.runtime
            .remove_schedule(&rule_schedule_id(id))
            .map_err(ServiceError::Internal)?;
        tracing::info!("Disabled rule {id}");
        Ok(())
    }

    /// Keep a contact's birthday reminder in line with its birthday fields:
    /// upsert the unique birthday rule when a birthday is set and reminders
    /// are on, soft-disable it otherwise.
    pub fn sync_birthday_reminder(
        &self,
        contact_id: &str,
        birthday: Option<&str>,
        enabled: Option<bool>,
        contact_name: Option<&str>,
    ) -> Result<Option<RecurrenceRule>, ServiceError> {
        let existing = self
            .store
            .find_birthday_rule(contact_id)
            .map_err(ServiceError::Internal)?;

        let active = birthday.is_some() && enabled != Some(false);
        if !active {
            if let Some(rule) = existing {
                self.store
                    .disable_rule(&rule.id)
                    .map_err(ServiceError::Internal)?;
                self.runtime
                    .remove_schedule(&rule_schedule_id(&rule.id))
                    .map_err(ServiceError::Internal)?;
                tracing::info!("Disabled birthday reminder for contact {contact_id}");
            }
            return Ok(None);
        }

        let (month, day) = parse_birthday(birthday.unwrap_or_default())?;
        let expr = build_expression(
            RuleKind::Birthday,
            0,
            self.recurrence.default_send_hour,
            Some(day),
            Some(month),
            None,
        )
        .map_err(|e| ServiceError::bad_request(e.to_string()))?;
        let content = self
            .recurrence
            .birthday_message
            .replace("{{name}}", contact_name.unwrap_or(NAME_FALLBACK));

        let rule = match existing {
            Some(rule) => {
                let patch = RulePatch {
                    content: Some(content),
                    cron_expression: Some(Some(expr)),
                    enabled: Some(true),
                    ..RulePatch::default()
                };
                self.store
                    .update_rule(&rule.id, &patch)
                    .map_err(ServiceError::Internal)?
                    .ok_or_else(|| ServiceError::not_found(format!("rule {}", rule.id)))?
            }
            None => {
                let mut rule = RecurrenceRule::new(
                    contact_id.to_string(),
                    RuleKind::Birthday,
                    content,
                );
                rule.cron_expression = Some(expr);
                self.store.insert_rule(&rule).map_err(ServiceError::Internal)?;
                rule
            }
        };
        self.register_rule_schedule(&rule)?;
        tracing::info!("Birthday reminder active for contact {contact_id}");
        Ok(Some(rule))
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn resolve_recipient(&self, req: &ScheduleRequest) -> Result<Recipient, ServiceError> {
        let keys = usize::from(req.contact_id.is_some())
            + usize::from(req.phone.is_some())
            + usize::from(req.group_id.is_some());
        if keys != 1 {
            return Err(ServiceError::bad_request(
                "exactly one of contactId, phone, or groupId is required",
            ));
        }

        if let Some(group_id) = &req.group_id {
            return Ok(Recipient::Group(group_id.clone()));
        }
        if let Some(contact_id) = &req.contact_id {
            let contact = self
                .contacts
                .find_contact(contact_id)
                .map_err(ServiceError::Internal)?
                .ok_or_else(|| ServiceError::ContactNotFound(contact_id.clone()))?;
            return Ok(Recipient::Contact(contact.id));
        }
        let phone = req.phone.as_deref().unwrap_or_default();
        let contact = self
            .contacts
            .resolve_or_create_by_phone(phone, req.name.as_deref())
            .map_err(|e| ServiceError::bad_request(e.to_string()))?;
        Ok(Recipient::Contact(contact.id))
    }

    fn resolve_rule_contact(
        &self,
        contact_id: Option<&str>,
        phone: Option<&str>,
    ) -> Result<String, ServiceError> {
        match (contact_id, phone) {
            (Some(id), None) => {
                let contact = self
                    .contacts
                    .find_contact(id)
                    .map_err(ServiceError::Internal)?
                    .ok_or_else(|| ServiceError::ContactNotFound(id.to_string()))?;
                Ok(contact.id)
            }
            (None, Some(phone)) => {
                let contact = self
                    .contacts
                    .resolve_or_create_by_phone(phone, None)
                    .map_err(|e| ServiceError::bad_request(e.to_string()))?;
                Ok(contact.id)
            }
            _ => Err(ServiceError::bad_request(
                "exactly one of contactId or phone is required",
            )),
        }
    }

    fn register_rule_schedule(&self, rule: &RecurrenceRule) -> Result<(), ServiceError> {
        let spec = ScheduleSpec::for_rule(rule, self.recurrence.default_send_hour)
            .map_err(ServiceError::Internal)?;
        let remaining = rule
            .max_occurrences
            .map(|max| max.saturating_sub(rule.occurrence_count));
        self.runtime
            .upsert_schedule(
                &rule_schedule_id(&rule.id),
                &spec,
                rule.end_date,
                remaining,
                &JobPayload::FireRecurrence {
                    rule_id: rule.id.clone(),
                },
            )
            .map_err(ServiceError::Internal)
    }
}

fn parse_media(
    url: Option<&str>,
    kind: Option<&str>,
) -> Result<Option<MediaRef>, ServiceError> {
    match (url, kind) {
        (None, None) => Ok(None),
        (Some(url), Some(kind)) => {
            if url.trim().is_empty() {
                return Err(ServiceError::bad_request("mediaUrl must not be empty"));
            }
            let kind = MediaKind::try_from(kind)
                .map_err(|e| ServiceError::bad_request(e.to_string()))?;
            Ok(Some(MediaRef {
                url: url.to_string(),
                kind,
            }))
        }
        (Some(_), None) => Err(ServiceError::bad_request(
            "mediaType is required when mediaUrl is set",
        )),
        (None, Some(_)) => Err(ServiceError::bad_request(
            "mediaUrl is required when mediaType is set",
        )),
    }
}

/// Parse an "MM-DD" birthday into (month, day).
fn parse_birthday(raw: &str) -> Result<(u32, u32), ServiceError> {
    let (month_raw, day_raw) = raw
        .split_once('-')
        .ok_or_else(|| ServiceError::bad_request(format!("birthday '{raw}' is not MM-DD")))?;
    let month: u32 = month_raw
        .parse()
        .map_err(|_| ServiceError::bad_request(format!("birthday '{raw}' is not MM-DD")))?;
    let day: u32 = day_raw
        .parse()
        .map_err(|_| ServiceError::bad_request(format!("birthday '{raw}' is not MM-DD")))?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(ServiceError::bad_request(format!(
            "birthday '{raw}' is out of range"
        )));
    }
    Ok((month, day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn service_with_cap(daily_cap: u32) -> (SchedulingService, Store) {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let limiter = RateLimiter::new(store.clone(), bus, daily_cap, 80);
        let runtime = JobRuntime::new(store.clone());
        let service = SchedulingService::new(
            store.clone(),
            Arc::new(store.clone()),
            limiter,
            runtime,
            RecurrenceConfig::default(),
        );
        (service, store)
    }

    fn phone_request(content: &str) -> ScheduleRequest {
        ScheduleRequest {
            phone: Some("9876543210".into()),
            content: content.into(),
            ..ScheduleRequest::default()
        }
    }

    fn job_count(store: &Store, status: &str) -> u32 {
        store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    [status],
                    |row| row.get(0),
                )?)
            })
            .unwrap()
    }

    #[test]
    fn schedule_immediate_creates_pending_intent_and_job() {
        let (service, store) = service_with_cap(30);
        let outcome = service.schedule(&phone_request("Hi")).unwrap();

        assert_eq!(outcome.intent.status, IntentStatus::Pending);
        assert_eq!(outcome.intent.content, "Hi");
        assert_eq!(outcome.rate_limit.sent_today, 0);
        assert_eq!(job_count(&store, "queued"), 1);

        // The auto-created contact carries the normalized phone.
        let listed = service
            .list(&ListQuery {
                phone: Some("9876543210".into()),
                ..ListQuery::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn schedule_requires_exactly_one_recipient() {
        let (service, _store) = service_with_cap(30);

        let none = ScheduleRequest {
            content: "x".into(),
            ..ScheduleRequest::default()
        };
        assert!(matches!(
            service.schedule(&none),
            Err(ServiceError::BadRequest(_))
        ));

        let both = ScheduleRequest {
            phone: Some("9876543210".into()),
            group_id: Some("g1".into()),
            content: "x".into(),
            ..ScheduleRequest::default()
        };
        assert!(matches!(
            service.schedule(&both),
            Err(ServiceError::BadRequest(_))
        ));
    }

    #[test]
    fn schedule_unknown_contact_id_is_contact_not_found() {
        let (service, _store) = service_with_cap(30);
        let req = ScheduleRequest {
            contact_id: Some("ghost".into()),
            content: "x".into(),
            ..ScheduleRequest::default()
        };
        assert!(matches!(
            service.schedule(&req),
            Err(ServiceError::ContactNotFound(_))
        ));
    }

    #[test]
    fn media_validation_pairs_url_and_type() {
        let (service, _store) = service_with_cap(30);

        let url_only = ScheduleRequest {
            media_url: Some("https://cdn.example/a.png".into()),
            ..phone_request("caption")
        };
        assert!(matches!(
            service.schedule(&url_only),
            Err(ServiceError::BadRequest(_))
        ));

        let bad_kind = ScheduleRequest {
            media_url: Some("https://cdn.example/a.png".into()),
            media_type: Some("sticker".into()),
            ..phone_request("caption")
        };
        assert!(matches!(
            service.schedule(&bad_kind),
            Err(ServiceError::BadRequest(_))
        ));

        // Empty content is fine once media is attached.
        let media_no_content = ScheduleRequest {
            media_url: Some("https://cdn.example/a.png".into()),
            media_type: Some("image".into()),
            ..phone_request("")
        };
        assert!(service.schedule(&media_no_content).is_ok());
    }

    #[test]
    fn immediate_send_fails_fast_at_cap() {
        let (service, store) = service_with_cap(1);
        // Occupy today's capacity.
        let first = service.schedule(&phone_request("one")).unwrap();
        store
            .mark_intent_sent(&first.intent.id, "P1", Utc::now())
            .unwrap();

        let err = service.schedule(&phone_request("two")).unwrap_err();
        match err {
            ServiceError::DailyCapReached(status) => {
                assert_eq!(status.sent_today, 1);
                assert_eq!(status.remaining, 0);
            }
            other => panic!("expected DailyCapReached, got {other:?}"),
        }

        // Future sends never fail the cap at schedule time.
        let future = ScheduleRequest {
            scheduled_at: Some(Utc::now() + Duration::hours(2)),
            ..phone_request("later")
        };
        assert!(service.schedule(&future).is_ok());
    }

    #[test]
    fn bulk_fails_fast_on_capacity_then_runs_per_item() {
        let (service, _store) = service_with_cap(2);

        let too_many = vec![
            phone_request("a"),
            phone_request("b"),
            phone_request("c"),
        ];
        assert!(matches!(
            service.schedule_bulk(&too_many),
            Err(ServiceError::DailyCapReached(_))
        ));

        let mixed = vec![
            phone_request("a"),
            ScheduleRequest {
                content: "no recipient".into(),
                ..ScheduleRequest::default()
            },
            ScheduleRequest {
                scheduled_at: Some(Utc::now() + Duration::hours(1)),
                ..phone_request("future")
            },
        ];
        let outcome = service.schedule_bulk(&mixed).unwrap();
        assert_eq!(outcome.scheduled.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].index, 1);
    }

    #[test]
    fn bulk_rejects_oversized_batches() {
        let (service, _store) = service_with_cap(30);
        let items: Vec<ScheduleRequest> = (0..501)
            .map(|_| ScheduleRequest {
                scheduled_at: Some(Utc::now() + Duration::hours(1)),
                ..phone_request("x")
            })
            .collect();
        assert!(matches!(
            service.schedule_bulk(&items),
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            service.schedule_bulk(&[]),
            Err(ServiceError::BadRequest(_))
        ));
    }

    #[test]
    fn edit_moves_schedule_and_reschedules_job() {
        let (service, store) = service_with_cap(30);
        let future = ScheduleRequest {
            scheduled_at: Some(Utc::now() + Duration::hours(1)),
            ..phone_request("original")
        };
        let outcome = service.schedule(&future).unwrap();

        let moved = Utc::now() + Duration::hours(2);
        let edited = service
            .edit(
                &outcome.intent.id,
                &EditRequest {
                    content: Some("updated".into()),
                    scheduled_at: Some(moved),
                    ..EditRequest::default()
                },
            )
            .unwrap();
        assert_eq!(edited.content, "updated");
        assert_eq!(edited.scheduled_at.timestamp(), moved.timestamp());
        assert_eq!(job_count(&store, "queued"), 1, "job replaced, not duplicated");

        // Editing a sent intent conflicts.
        store
            .mark_intent_sent(&outcome.intent.id, "P", Utc::now())
            .unwrap();
        assert!(matches!(
            service.edit(&outcome.intent.id, &EditRequest::default()),
            Err(ServiceError::Conflict(_))
        ));
    }

    #[test]
    fn cancel_is_idempotent_and_removes_job() {
        let (service, store) = service_with_cap(30);
        let outcome = service
            .schedule(&ScheduleRequest {
                scheduled_at: Some(Utc::now() + Duration::hours(1)),
                ..phone_request("bye")
            })
            .unwrap();

        let cancelled = service.cancel(&outcome.intent.id).unwrap().unwrap();
        assert_eq!(cancelled.status, IntentStatus::Cancelled);
        assert_eq!(job_count(&store, "queued"), 0);

        // Second cancel: Ok(None).
        assert!(service.cancel(&outcome.intent.id).unwrap().is_none());
        // Unknown id: NotFound.
        assert!(matches!(
            service.cancel("ghost"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn retry_resets_failed_intent_and_requeues() {
        let (service, store) = service_with_cap(30);
        let outcome = service.schedule(&phone_request("flaky")).unwrap();
        store
            .mark_intent_failed(&outcome.intent.id, "socket down")
            .unwrap();
        store
            .with_conn(|conn| {
                conn.execute("DELETE FROM jobs", [])?;
                Ok(())
            })
            .unwrap();

        let retried = service.retry(&outcome.intent.id).unwrap();
        assert_eq!(retried.status, IntentStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert_eq!(job_count(&store, "queued"), 1);

        // Only failed intents retry.
        assert!(matches!(
            service.retry(&outcome.intent.id),
            Err(ServiceError::Conflict(_))
        ));
    }

    #[test]
    fn list_validates_inputs() {
        let (service, _store) = service_with_cap(30);
        assert!(matches!(
            service.list(&ListQuery {
                status: Some("bogus".into()),
                ..ListQuery::default()
            }),
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            service.list(&ListQuery {
                limit: Some(500),
                ..ListQuery::default()
            }),
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            service.list(&ListQuery {
                phone_mode: Some("invert".into()),
                ..ListQuery::default()
            }),
            Err(ServiceError::BadRequest(_))
        ));
    }

    #[test]
    fn create_rule_computes_cron_and_registers_schedule() {
        let (service, store) = service_with_cap(30);
        let rule = service
            .create_rule(&CreateRuleRequest {
                phone: Some("9876543210".into()),
                kind: "weekly".into(),
                content: "Friday check-in".into(),
                hour: Some(18),
                day_of_week: Some(5),
                ..CreateRuleRequest::default()
            })
            .unwrap();
        assert_eq!(rule.cron_expression.as_deref(), Some("0 0 18 * * FRI"));

        let schedules: u32 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(schedules, 1);
    }

    #[test]
    fn create_custom_rule_needs_interval() {
        let (service, _store) = service_with_cap(30);
        let missing = CreateRuleRequest {
            phone: Some("9876543210".into()),
            kind: "custom".into(),
            content: "ping".into(),
            ..CreateRuleRequest::default()
        };
        assert!(matches!(
            service.create_rule(&missing),
            Err(ServiceError::BadRequest(_))
        ));

        let ok = CreateRuleRequest {
            every_n_days: Some(3),
            ..missing
        };
        let rule = service.create_rule(&ok).unwrap();
        assert_eq!(rule.every_n_days, Some(3));
        assert!(rule.cron_expression.is_none());
    }

    #[test]
    fn disable_rule_soft_deletes_and_removes_schedule() {
        let (service, store) = service_with_cap(30);
        let rule = service
            .create_rule(&CreateRuleRequest {
                phone: Some("9876543210".into()),
                kind: "daily".into(),
                content: "gm".into(),
                ..CreateRuleRequest::default()
            })
            .unwrap();

        service.disable_rule(&rule.id).unwrap();
        let found = service.get_rule(&rule.id).unwrap();
        assert!(!found.enabled);
        let schedules: u32 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(schedules, 0);

        assert!(matches!(
            service.disable_rule("ghost"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn update_rule_toggles_schedule_registration() {
        let (service, store) = service_with_cap(30);
        let rule = service
            .create_rule(&CreateRuleRequest {
                phone: Some("9876543210".into()),
                kind: "daily".into(),
                content: "gm".into(),
                ..CreateRuleRequest::default()
            })
            .unwrap();

        let disabled = service
            .update_rule(
                &rule.id,
                &UpdateRuleRequest {
                    enabled: Some(false),
                    ..UpdateRuleRequest::default()
                },
            )
            .unwrap();
        assert!(!disabled.enabled);
        let schedules: u32 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(schedules, 0);

        let enabled = service
            .update_rule(
                &rule.id,
                &UpdateRuleRequest {
                    enabled: Some(true),
                    content: Some("good morning".into()),
                    ..UpdateRuleRequest::default()
                },
            )
            .unwrap();
        assert!(enabled.enabled);
        assert_eq!(enabled.content, "good morning");
        let schedules: u32 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(schedules, 1);
    }

    #[test]
    fn birthday_sync_creates_updates_and_disables() {
        let (service, store) = service_with_cap(30);
        let contact = store
            .resolve_or_create_by_phone("9876543210", Some("Asha"))
            .unwrap();

        // Birthday set: a yearly rule appears with the template filled in.
        let rule = service
            .sync_birthday_reminder(&contact.id, Some("03-15"), Some(true), Some("Asha"))
            .unwrap()
            .unwrap();
        assert_eq!(rule.kind, RuleKind::Birthday);
        assert_eq!(rule.cron_expression.as_deref(), Some("0 0 9 15 3 *"));
        assert!(rule.content.contains("Asha"));

        // Re-sync with a new date updates the same rule, never a second one.
        let updated = service
            .sync_birthday_reminder(&contact.id, Some("04-01"), Some(true), Some("Asha"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.cron_expression.as_deref(), Some("0 0 9 1 4 *"));
        assert_eq!(store.list_rules(Some(&contact.id)).unwrap().len(), 1);

        // Clearing the birthday disables the rule and its schedule.
        let cleared = service
            .sync_birthday_reminder(&contact.id, None, None, Some("Asha"))
            .unwrap();
        assert!(cleared.is_none());
        let remaining = store.find_birthday_rule(&contact.id).unwrap().unwrap();
        assert!(!remaining.enabled);
        let schedules: u32 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(schedules, 0);
    }

    #[test]
    fn birthday_sync_without_name_uses_fallback() {
        let (service, store) = service_with_cap(30);
        let contact = store.resolve_or_create_by_phone("9000000003", None).unwrap();

        let rule = service
            .sync_birthday_reminder(&contact.id, Some("12-31"), None, None)
            .unwrap()
            .unwrap();
        assert!(rule.content.contains(NAME_FALLBACK));
    }

    #[test]
    fn birthday_parsing_rejects_garbage() {
        assert!(parse_birthday("03-15").is_ok());
        for bad in ["0315", "13-01", "02-40", "xx-yy", ""] {
            assert!(parse_birthday(bad).is_err(), "accepted: {bad}");
        }
    }
}
