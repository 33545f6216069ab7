//! Intent records and their state machine queries.
//!
//! Status transitions are enforced in SQL with conditional updates: the
//! first committer wins and the loser observes zero changed rows. This is
//! what makes concurrent cancel-vs-dispatch safe without row locks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_opt_rfc3339, parse_rfc3339, Store};

// ── Model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl IntentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl TryFrom<&str> for IntentStatus {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => anyhow::bail!("Invalid intent status '{other}'"),
        }
    }
}

/// Exactly one recipient kind per intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Contact(String),
    Group(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }
}

impl TryFrom<&str> for MediaKind {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" => Ok(Self::Document),
            other => anyhow::bail!(
                "Invalid media kind '{other}'. Expected one of: image, video, audio, document"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub id: String,
    pub recipient: Recipient,
    pub content: String,
    pub media: Option<MediaRef>,
    pub scheduled_at: DateTime<Utc>,
    pub status: IntentStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub recurrence_rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    /// Fresh pending intent, not yet persisted.
    pub fn new(
        recipient: Recipient,
        content: String,
        media: Option<MediaRef>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            recipient,
            content,
            media,
            scheduled_at,
            status: IntentStatus::Pending,
            provider_message_id: None,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            failure_reason: None,
            attempts: 0,
            recurrence_rule_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields an edit may change while the intent is still pending.
#[derive(Debug, Clone, Default)]
pub struct IntentPatch {
    pub content: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears media, `Some(Some(_))` replaces it.
    pub media: Option<Option<MediaRef>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhoneMode {
    #[default]
    Include,
    Exclude,
}

#[derive(Debug, Clone, Default)]
pub struct IntentFilter {
    pub status: Option<IntentStatus>,
    pub contact_id: Option<String>,
    pub phone: Option<String>,
    pub phone_mode: PhoneMode,
    pub limit: u32,
    pub offset: u32,
}

// ── Row mapping ───────────────────────────────────────────────────

const INTENT_COLUMNS: &str = "i.id, i.contact_id, i.group_id, i.content, i.media_url, \
     i.media_kind, i.scheduled_at, i.status, i.provider_message_id, i.sent_at, \
     i.delivered_at, i.failed_at, i.failure_reason, i.attempts, i.recurrence_rule_id, \
     i.created_at, i.updated_at";

struct RawIntent {
    id: String,
    contact_id: Option<String>,
    group_id: Option<String>,
    content: String,
    media_url: Option<String>,
    media_kind: Option<String>,
    scheduled_at: String,
    status: String,
    provider_message_id: Option<String>,
    sent_at: Option<String>,
    delivered_at: Option<String>,
    failed_at: Option<String>,
    failure_reason: Option<String>,
    attempts: u32,
    recurrence_rule_id: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_row(row: &Row) -> rusqlite::Result<RawIntent> {
    Ok(RawIntent {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        group_id: row.get(2)?,
        content: row.get(3)?,
        media_url: row.get(4)?,
        media_kind: row.get(5)?,
        scheduled_at: row.get(6)?,
        status: row.get(7)?,
        provider_message_id: row.get(8)?,
        sent_at: row.get(9)?,
        delivered_at: row.get(10)?,
        failed_at: row.get(11)?,
        failure_reason: row.get(12)?,
        attempts: row.get(13)?,
        recurrence_rule_id: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn from_raw(raw: RawIntent) -> Result<Intent> {
    let recipient = match (raw.contact_id, raw.group_id) {
        (Some(contact), None) => Recipient::Contact(contact),
        (None, Some(group)) => Recipient::Group(group),
        _ => anyhow::bail!("Intent {} has inconsistent recipient columns", raw.id),
    };
    let media = match (raw.media_url, raw.media_kind) {
        (Some(url), Some(kind)) => Some(MediaRef {
            url,
            kind: MediaKind::try_from(kind.as_str())?,
        }),
        (None, None) => None,
        _ => anyhow::bail!("Intent {} has inconsistent media columns", raw.id),
    };
    Ok(Intent {
        id: raw.id,
        recipient,
        content: raw.content,
        media,
        scheduled_at: parse_rfc3339(&raw.scheduled_at)?,
        status: IntentStatus::try_from(raw.status.as_str())?,
        provider_message_id: raw.provider_message_id,
        sent_at: parse_opt_rfc3339(raw.sent_at)?,
        delivered_at: parse_opt_rfc3339(raw.delivered_at)?,
        failed_at: parse_opt_rfc3339(raw.failed_at)?,
        failure_reason: raw.failure_reason,
        attempts: raw.attempts,
        recurrence_rule_id: raw.recurrence_rule_id,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
    })
}

/// Insert inside an existing transaction. Used when a rule firing must
/// create the intent and bump the rule atomically.
pub(crate) fn insert_tx(tx: &rusqlite::Transaction, intent: &Intent) -> Result<()> {
    let (contact_id, group_id) = match &intent.recipient {
        Recipient::Contact(id) => (Some(id.as_str()), None),
        Recipient::Group(id) => (None, Some(id.as_str())),
    };
    let (media_url, media_kind) = match &intent.media {
        Some(m) => (Some(m.url.as_str()), Some(m.kind.as_str())),
        None => (None, None),
    };
    tx.execute(
        "INSERT INTO intents (id, contact_id, group_id, content, media_url, media_kind,
             scheduled_at, status, attempts, recurrence_rule_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            intent.id,
            contact_id,
            group_id,
            intent.content,
            media_url,
            media_kind,
            intent.scheduled_at.to_rfc3339(),
            intent.status.as_str(),
            intent.attempts,
            intent.recurrence_rule_id,
            intent.created_at.to_rfc3339(),
            intent.updated_at.to_rfc3339(),
        ],
    )
    .context("Failed to insert intent")?;
    Ok(())
}

// ── Queries ───────────────────────────────────────────────────────

impl Store {
    pub fn insert_intent(&self, intent: &Intent) -> Result<()> {
        self.with_tx(|tx| insert_tx(tx, intent))
    }

    pub fn find_intent(&self, id: &str) -> Result<Option<Intent>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {INTENT_COLUMNS} FROM intents i WHERE i.id = ?1"),
                    params![id],
                    map_row,
                )
                .optional()
                .context("Failed to query intent")?;
            raw.map(from_raw).transpose()
        })
    }

    pub fn find_by_provider_message_id(&self, provider_id: &str) -> Result<Option<Intent>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {INTENT_COLUMNS} FROM intents i
                         WHERE i.provider_message_id = ?1"
                    ),
                    params![provider_id],
                    map_row,
                )
                .optional()
                .context("Failed to query intent by provider message id")?;
            raw.map(from_raw).transpose()
        })
    }

    pub fn list_intents(&self, filter: &IntentFilter) -> Result<Vec<Intent>> {
        let mut sql = format!(
            "SELECT {INTENT_COLUMNS} FROM intents i
             LEFT JOIN contacts c ON c.id = i.contact_id WHERE 1=1"
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND i.status = ?");
            args.push(status.as_str().to_string());
        }
        if let Some(contact_id) = &filter.contact_id {
            sql.push_str(" AND i.contact_id = ?");
            args.push(contact_id.clone());
        }
        if let Some(phone) = &filter.phone {
            match filter.phone_mode {
                PhoneMode::Include => {
                    sql.push_str(" AND c.phone = ?");
                }
                PhoneMode::Exclude => {
                    sql.push_str(" AND (i.contact_id IS NULL OR c.phone != ?)");
                }
            }
            args.push(phone.clone());
        }

        let limit = if filter.limit == 0 {
            50
        } else {
            filter.limit.min(200)
        };
        sql.push_str(&format!(
            " ORDER BY i.scheduled_at DESC LIMIT {limit} OFFSET {}",
            filter.offset
        ));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), map_row)?;
            let mut intents = Vec::new();
            for row in rows {
                intents.push(from_raw(row?)?);
            }
            Ok(intents)
        })
    }

    /// Apply an edit to a pending intent. Returns the updated row, or `None`
    /// when the intent is missing or no longer pending.
    pub fn update_pending_intent(&self, id: &str, patch: &IntentPatch) -> Result<Option<Intent>> {
        let changed = self.with_conn(|conn| {
            let mut sets: Vec<String> = vec!["updated_at = ?".into()];
            let mut args: Vec<Option<String>> = vec![Some(Utc::now().to_rfc3339())];

            if let Some(content) = &patch.content {
                sets.push("content = ?".into());
                args.push(Some(content.clone()));
            }
            if let Some(at) = patch.scheduled_at {
                sets.push("scheduled_at = ?".into());
                args.push(Some(at.to_rfc3339()));
            }
            if let Some(media) = &patch.media {
                sets.push("media_url = ?".into());
                sets.push("media_kind = ?".into());
                match media {
                    Some(m) => {
                        args.push(Some(m.url.clone()));
                        args.push(Some(m.kind.as_str().to_string()));
                    }
                    None => {
                        args.push(None);
                        args.push(None);
                    }
                }
            }

            args.push(Some(id.to_string()));
            let sql = format!(
                "UPDATE intents SET {} WHERE id = ? AND status = 'pending'",
                sets.join(", ")
            );
            conn.execute(&sql, params_from_iter(args.iter()))
                .context("Failed to update pending intent")
        })?;

        if changed == 0 {
            return Ok(None);
        }
        self.find_intent(id)
    }

    /// `pending → sent`, stamping the provider id and bumping attempts.
    /// Returns false when the row was not pending (lost the race).
    pub fn mark_intent_sent(
        &self,
        id: &str,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE intents
                     SET status = 'sent', provider_message_id = ?2, sent_at = ?3,
                         attempts = attempts + 1, updated_at = ?4
                     WHERE id = ?1 AND status = 'pending'",
                    params![
                        id,
                        provider_message_id,
                        sent_at.to_rfc3339(),
                        Utc::now().to_rfc3339()
                    ],
                )
                .context("Failed to mark intent sent")?;
            Ok(changed == 1)
        })
    }

    /// `pending → failed`. Also bumps attempts: a dispatch attempt happened.
    pub fn mark_intent_failed(&self, id: &str, reason: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "UPDATE intents
                     SET status = 'failed', failed_at = ?2, failure_reason = ?3,
                         attempts = attempts + 1, updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now, reason],
                )
                .context("Failed to mark intent failed")?;
            Ok(changed == 1)
        })
    }

    /// `sent → delivered`. Idempotent: a second ack changes nothing.
    pub fn mark_intent_delivered(&self, id: &str, delivered_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE intents
                     SET status = 'delivered', delivered_at = ?2, updated_at = ?3
                     WHERE id = ?1 AND status = 'sent'",
                    params![id, delivered_at.to_rfc3339(), Utc::now().to_rfc3339()],
                )
                .context("Failed to mark intent delivered")?;
            Ok(changed == 1)
        })
    }

    /// Atomic `pending → cancelled`. Returns the updated row, or `None` when
    /// the intent was not pending.
    pub fn cancel_intent(&self, id: &str) -> Result<Option<Intent>> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE intents SET status = 'cancelled', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, Utc::now().to_rfc3339()],
            )
            .context("Failed to cancel intent")
        })?;
        if changed == 0 {
            return Ok(None);
        }
        self.find_intent(id)
    }

    /// Atomic `failed → pending` with attempt/failure fields reset and the
    /// schedule moved to now.
    pub fn retry_intent(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Intent>> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE intents
                 SET status = 'pending', attempts = 0, failed_at = NULL,
                     failure_reason = NULL, scheduled_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed'",
                params![id, now.to_rfc3339()],
            )
            .context("Failed to retry intent")
        })?;
        if changed == 0 {
            return Ok(None);
        }
        self.find_intent(id)
    }

    /// Count of successful sends inside a window. Feeds the rate limiter.
    pub fn count_terminal_success_in(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM intents
                 WHERE status IN ('sent', 'delivered')
                   AND sent_at >= ?1 AND sent_at < ?2",
                params![start.to_rfc3339(), end.to_rfc3339()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Retention sweep: delete terminal intents sent before the cutoff.
    /// Returns the number of rows removed.
    pub fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[IntentStatus],
    ) -> Result<usize> {
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.with_conn(|conn| {
            let sql = format!(
                "DELETE FROM intents
                 WHERE status IN ({list}) AND sent_at IS NOT NULL AND sent_at < ?1"
            );
            conn.execute(&sql, params![cutoff.to_rfc3339()])
                .context("Failed to sweep old intents")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::ContactStore;
    use chrono::Duration;

    fn store_with_contact() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        let contact = store.resolve_or_create_by_phone("9876543210", None).unwrap();
        (store, contact.id)
    }

    fn pending(store: &Store, contact_id: &str) -> Intent {
        let intent = Intent::new(
            Recipient::Contact(contact_id.to_string()),
            "hello".into(),
            None,
            Utc::now(),
        );
        store.insert_intent(&intent).unwrap();
        intent
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);

        let found = store.find_intent(&intent.id).unwrap().unwrap();
        assert_eq!(found.id, intent.id);
        assert_eq!(found.status, IntentStatus::Pending);
        assert_eq!(found.recipient, Recipient::Contact(contact_id));
        assert_eq!(found.attempts, 0);
    }

    #[test]
    fn find_missing_returns_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.find_intent("nope").unwrap().is_none());
    }

    #[test]
    fn media_roundtrip() {
        let (store, contact_id) = store_with_contact();
        let intent = Intent::new(
            Recipient::Contact(contact_id),
            "see attached".into(),
            Some(MediaRef {
                url: "https://cdn.example/report.pdf".into(),
                kind: MediaKind::Document,
            }),
            Utc::now(),
        );
        store.insert_intent(&intent).unwrap();

        let found = store.find_intent(&intent.id).unwrap().unwrap();
        let media = found.media.unwrap();
        assert_eq!(media.kind, MediaKind::Document);
        assert_eq!(media.url, "https://cdn.example/report.pdf");
    }

    #[test]
    fn group_recipient_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let intent = Intent::new(
            Recipient::Group("120363041234567890".into()),
            "team update".into(),
            None,
            Utc::now(),
        );
        store.insert_intent(&intent).unwrap();
        let found = store.find_intent(&intent.id).unwrap().unwrap();
        assert_eq!(
            found.recipient,
            Recipient::Group("120363041234567890".into())
        );
    }

    #[test]
    fn mark_sent_bumps_attempts_and_is_single_shot() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);

        assert!(store
            .mark_intent_sent(&intent.id, "PROV-1", Utc::now())
            .unwrap());
        let sent = store.find_intent(&intent.id).unwrap().unwrap();
        assert_eq!(sent.status, IntentStatus::Sent);
        assert_eq!(sent.attempts, 1);
        assert_eq!(sent.provider_message_id.as_deref(), Some("PROV-1"));
        assert!(sent.sent_at.is_some());

        // Terminal status is sticky: a second dispatch writes nothing.
        assert!(!store
            .mark_intent_sent(&intent.id, "PROV-2", Utc::now())
            .unwrap());
        let again = store.find_intent(&intent.id).unwrap().unwrap();
        assert_eq!(again.provider_message_id.as_deref(), Some("PROV-1"));
    }

    #[test]
    fn cancel_wins_over_late_dispatch() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);

        let cancelled = store.cancel_intent(&intent.id).unwrap().unwrap();
        assert_eq!(cancelled.status, IntentStatus::Cancelled);

        // The dispatcher arriving afterwards observes the terminal row.
        assert!(!store
            .mark_intent_sent(&intent.id, "PROV-X", Utc::now())
            .unwrap());
        assert!(!store.mark_intent_failed(&intent.id, "late").unwrap());
    }

    #[test]
    fn cancel_non_pending_returns_none() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);
        store
            .mark_intent_sent(&intent.id, "PROV-1", Utc::now())
            .unwrap();
        assert!(store.cancel_intent(&intent.id).unwrap().is_none());
    }

    #[test]
    fn delivered_only_from_sent_and_idempotent() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);

        // Not yet sent: no-op.
        assert!(!store.mark_intent_delivered(&intent.id, Utc::now()).unwrap());

        store
            .mark_intent_sent(&intent.id, "PROV-1", Utc::now())
            .unwrap();
        assert!(store.mark_intent_delivered(&intent.id, Utc::now()).unwrap());
        assert!(!store.mark_intent_delivered(&intent.id, Utc::now()).unwrap());

        let row = store.find_intent(&intent.id).unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Delivered);
        assert!(row.sent_at.is_some(), "delivered implies sent_at");
    }

    #[test]
    fn retry_resets_failure_fields() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);
        store.mark_intent_failed(&intent.id, "socket down").unwrap();

        let retried = store.retry_intent(&intent.id, Utc::now()).unwrap().unwrap();
        assert_eq!(retried.status, IntentStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(retried.failed_at.is_none());
        assert!(retried.failure_reason.is_none());

        // Retry only applies to failed intents.
        assert!(store.retry_intent(&intent.id, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn edit_applies_only_while_pending() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);
        let later = Utc::now() + Duration::hours(2);

        let patch = IntentPatch {
            content: Some("updated".into()),
            scheduled_at: Some(later),
            media: None,
        };
        let updated = store
            .update_pending_intent(&intent.id, &patch)
            .unwrap()
            .unwrap();
        assert_eq!(updated.content, "updated");
        assert_eq!(updated.scheduled_at.timestamp(), later.timestamp());

        store
            .mark_intent_sent(&intent.id, "PROV-1", Utc::now())
            .unwrap();
        assert!(store
            .update_pending_intent(&intent.id, &patch)
            .unwrap()
            .is_none());
    }

    #[test]
    fn edit_can_clear_media() {
        let (store, contact_id) = store_with_contact();
        let intent = Intent::new(
            Recipient::Contact(contact_id),
            "pic".into(),
            Some(MediaRef {
                url: "https://cdn.example/pic.png".into(),
                kind: MediaKind::Image,
            }),
            Utc::now(),
        );
        store.insert_intent(&intent).unwrap();

        let patch = IntentPatch {
            media: Some(None),
            ..IntentPatch::default()
        };
        let updated = store
            .update_pending_intent(&intent.id, &patch)
            .unwrap()
            .unwrap();
        assert!(updated.media.is_none());
    }

    #[test]
    fn list_filters_by_status_and_phone() {
        let (store, contact_id) = store_with_contact();
        let other = store.resolve_or_create_by_phone("9000000001", None).unwrap();

        let a = pending(&store, &contact_id);
        let b = pending(&store, &other.id);
        store.mark_intent_sent(&b.id, "P", Utc::now()).unwrap();

        let pending_only = store
            .list_intents(&IntentFilter {
                status: Some(IntentStatus::Pending),
                ..IntentFilter::default()
            })
            .unwrap();
        assert_eq!(pending_only.len(), 1);
        assert_eq!(pending_only[0].id, a.id);

        let by_phone = store
            .list_intents(&IntentFilter {
                phone: Some("9000000001".into()),
                ..IntentFilter::default()
            })
            .unwrap();
        assert_eq!(by_phone.len(), 1);
        assert_eq!(by_phone[0].id, b.id);

        let excluding = store
            .list_intents(&IntentFilter {
                phone: Some("9000000001".into()),
                phone_mode: PhoneMode::Exclude,
                ..IntentFilter::default()
            })
            .unwrap();
        assert_eq!(excluding.len(), 1);
        assert_eq!(excluding[0].id, a.id);
    }

    #[test]
    fn list_limit_is_capped_at_200() {
        let store = Store::open_in_memory().unwrap();
        let filter = IntentFilter {
            limit: 5000,
            ..IntentFilter::default()
        };
        // Just verifying the query builds and runs with the clamp applied.
        assert!(store.list_intents(&filter).unwrap().is_empty());
    }

    #[test]
    fn count_terminal_success_window() {
        let (store, contact_id) = store_with_contact();
        let now = Utc::now();

        let a = pending(&store, &contact_id);
        store.mark_intent_sent(&a.id, "P1", now).unwrap();

        let b = pending(&store, &contact_id);
        store.mark_intent_sent(&b.id, "P2", now).unwrap();
        store.mark_intent_delivered(&b.id, now).unwrap();

        // Failed and pending rows never count.
        let c = pending(&store, &contact_id);
        store.mark_intent_failed(&c.id, "cap").unwrap();
        pending(&store, &contact_id);

        let count = store
            .count_terminal_success_in(now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert_eq!(count, 2);

        let outside = store
            .count_terminal_success_in(now + Duration::hours(2), now + Duration::hours(3))
            .unwrap();
        assert_eq!(outside, 0);
    }

    #[test]
    fn sweep_removes_only_old_terminal_rows() {
        let (store, contact_id) = store_with_contact();
        let old = Utc::now() - Duration::days(40);

        let swept = pending(&store, &contact_id);
        store.mark_intent_sent(&swept.id, "P1", old).unwrap();

        let fresh = pending(&store, &contact_id);
        store.mark_intent_sent(&fresh.id, "P2", Utc::now()).unwrap();

        let still_pending = pending(&store, &contact_id);

        let removed = store
            .delete_terminal_older_than(
                Utc::now() - Duration::days(30),
                &[
                    IntentStatus::Sent,
                    IntentStatus::Delivered,
                    IntentStatus::Failed,
                ],
            )
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_intent(&swept.id).unwrap().is_none());
        assert!(store.find_intent(&fresh.id).unwrap().is_some());
        assert!(store.find_intent(&still_pending.id).unwrap().is_some());
    }

    #[test]
    fn provider_message_id_lookup() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);
        store
            .mark_intent_sent(&intent.id, "3EB0538A1F2C", Utc::now())
            .unwrap();

        let found = store
            .find_by_provider_message_id("3EB0538A1F2C")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, intent.id);
        assert!(store
            .find_by_provider_message_id("missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn deleting_contact_cascades_to_intents() {
        let (store, contact_id) = store_with_contact();
        let intent = pending(&store, &contact_id);

        store
            .with_conn(|conn| {
                conn.execute("DELETE FROM contacts WHERE id = ?1", params![contact_id])?;
                Ok(())
            })
            .unwrap();
        assert!(store.find_intent(&intent.id).unwrap().is_none());
    }
}
