//! Recurrence rule records.
//!
//! A rule is a template producing one fresh intent per firing. The firing
//! itself is transactional: inserting the intent, bumping the occurrence
//! counter, stamping `last_fired_at`, and auto-disabling at the occurrence
//! limit all commit together.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::intents::{insert_tx, Intent, MediaKind, MediaRef};
use super::{parse_opt_rfc3339, parse_rfc3339, Store};

// ── Model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Custom,
    Birthday,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
            Self::Custom => "custom",
            Self::Birthday => "birthday",
        }
    }

    /// `custom` rules are interval-based; every other kind carries a cron
    /// expression.
    pub fn uses_interval(self) -> bool {
        matches!(self, Self::Custom)
    }
}

impl TryFrom<&str> for RuleKind {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            "custom" => Ok(Self::Custom),
            "birthday" => Ok(Self::Birthday),
            other => anyhow::bail!("Invalid rule kind '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecurrenceRule {
    pub id: String,
    pub contact_id: String,
    pub kind: RuleKind,
    pub content: String,
    pub media: Option<MediaRef>,
    pub cron_expression: Option<String>,
    pub every_n_days: Option<u32>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<u32>,
    pub occurrence_count: u32,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurrenceRule {
    pub fn new(contact_id: String, kind: RuleKind, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            contact_id,
            kind,
            content,
            media: None,
            cron_expression: None,
            every_n_days: None,
            end_date: None,
            max_occurrences: None,
            occurrence_count: 0,
            enabled: true,
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the rule has naturally terminated (end date passed or
    /// occurrence limit hit).
    pub fn exhausted(&self, now: DateTime<Utc>) -> bool {
        if let Some(end) = self.end_date {
            if now > end {
                return true;
            }
        }
        if let Some(max) = self.max_occurrences {
            if self.occurrence_count >= max {
                return true;
            }
        }
        false
    }
}

/// Editable fields on a rule.
#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub content: Option<String>,
    pub media: Option<Option<MediaRef>>,
    pub cron_expression: Option<Option<String>>,
    pub every_n_days: Option<Option<u32>>,
    pub end_date: Option<Option<DateTime<Utc>>>,
    pub max_occurrences: Option<Option<u32>>,
    pub enabled: Option<bool>,
}

// ── Row mapping ───────────────────────────────────────────────────

const RULE_COLUMNS: &str = "id, contact_id, kind, content, media_url, media_kind, \
     cron_expression, every_n_days, end_date, max_occurrences, occurrence_count, \
     enabled, last_fired_at, created_at, updated_at";

struct RawRule {
    id: String,
    contact_id: String,
    kind: String,
    content: String,
    media_url: Option<String>,
    media_kind: Option<String>,
    cron_expression: Option<String>,
    every_n_days: Option<u32>,
    end_date: Option<String>,
    max_occurrences: Option<u32>,
    occurrence_count: u32,
    enabled: bool,
    last_fired_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_row(row: &Row) -> rusqlite::Result<RawRule> {
    Ok(RawRule {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        kind: row.get(2)?,
        content: row.get(3)?,
        media_url: row.get(4)?,
        media_kind: row.get(5)?,
        cron_expression: row.get(6)?,
        every_n_days: row.get(7)?,
        end_date: row.get(8)?,
        max_occurrences: row.get(9)?,
        occurrence_count: row.get(10)?,
        enabled: row.get(11)?,
        last_fired_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn from_raw(raw: RawRule) -> Result<RecurrenceRule> {
    let media = match (raw.media_url, raw.media_kind) {
        (Some(url), Some(kind)) => Some(MediaRef {
            url,
            kind: MediaKind::try_from(kind.as_str())?,
        }),
        (None, None) => None,
        _ => anyhow::bail!("Rule {} has inconsistent media columns", raw.id),
    };
    Ok(RecurrenceRule {
        id: raw.id,
        contact_id: raw.contact_id,
        kind: RuleKind::try_from(raw.kind.as_str())?,
        content: raw.content,
        media,
        cron_expression: raw.cron_expression,
        every_n_days: raw.every_n_days,
        end_date: parse_opt_rfc3339(raw.end_date)?,
        max_occurrences: raw.max_occurrences,
        occurrence_count: raw.occurrence_count,
        enabled: raw.enabled,
        last_fired_at: parse_opt_rfc3339(raw.last_fired_at)?,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
    })
}

// ── Queries ───────────────────────────────────────────────────────

impl Store {
    pub fn insert_rule(&self, rule: &RecurrenceRule) -> Result<()> {
        let (media_url, media_kind) = match &rule.media {
            Some(m) => (Some(m.url.as_str()), Some(m.kind.as_str())),
            None => (None, None),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO recurrence_rules (id, contact_id, kind, content, media_url,
                     media_kind, cron_expression, every_n_days, end_date, max_occurrences,
                     occurrence_count, enabled, last_fired_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    rule.id,
                    rule.contact_id,
                    rule.kind.as_str(),
                    rule.content,
                    media_url,
                    media_kind,
                    rule.cron_expression,
                    rule.every_n_days,
                    rule.end_date.map(|d| d.to_rfc3339()),
                    rule.max_occurrences,
                    rule.occurrence_count,
                    rule.enabled,
                    rule.last_fired_at.map(|d| d.to_rfc3339()),
                    rule.created_at.to_rfc3339(),
                    rule.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert recurrence rule")?;
            Ok(())
        })
    }

    pub fn find_rule(&self, id: &str) -> Result<Option<RecurrenceRule>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {RULE_COLUMNS} FROM recurrence_rules WHERE id = ?1"),
                    params![id],
                    map_row,
                )
                .optional()
                .context("Failed to query rule")?;
            raw.map(from_raw).transpose()
        })
    }

    pub fn list_rules(&self, contact_id: Option<&str>) -> Result<Vec<RecurrenceRule>> {
        self.with_conn(|conn| {
            let (sql, args) = match contact_id {
                Some(contact) => (
                    format!(
                        "SELECT {RULE_COLUMNS} FROM recurrence_rules
                         WHERE contact_id = ?1 ORDER BY created_at DESC"
                    ),
                    vec![contact.to_string()],
                ),
                None => (
                    format!(
                        "SELECT {RULE_COLUMNS} FROM recurrence_rules ORDER BY created_at DESC"
                    ),
                    Vec::new(),
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), map_row)?;
            let mut rules = Vec::new();
            for row in rows {
                rules.push(from_raw(row?)?);
            }
            Ok(rules)
        })
    }

    /// The unique birthday rule for a contact, enabled or not.
    pub fn find_birthday_rule(&self, contact_id: &str) -> Result<Option<RecurrenceRule>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {RULE_COLUMNS} FROM recurrence_rules
                         WHERE contact_id = ?1 AND kind = 'birthday'"
                    ),
                    params![contact_id],
                    map_row,
                )
                .optional()
                .context("Failed to query birthday rule")?;
            raw.map(from_raw).transpose()
        })
    }

    /// Apply a patch. Returns the updated rule, or `None` when missing.
    pub fn update_rule(&self, id: &str, patch: &RulePatch) -> Result<Option<RecurrenceRule>> {
        let changed = self.with_conn(|conn| {
            let mut sets: Vec<&str> = vec!["updated_at = ?"];
            let mut args: Vec<Option<String>> = vec![Some(Utc::now().to_rfc3339())];

            if let Some(content) = &patch.content {
                sets.push("content = ?");
                args.push(Some(content.clone()));
            }
            if let Some(media) = &patch.media {
                sets.push("media_url = ?");
                sets.push("media_kind = ?");
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
            if let Some(expr) = &patch.cron_expression {
                sets.push("cron_expression = ?");
                args.push(expr.clone());
            }
            if let Some(days) = &patch.every_n_days {
                sets.push("every_n_days = ?");
                args.push(days.map(|d| d.to_string()));
            }
            if let Some(end) = &patch.end_date {
                sets.push("end_date = ?");
                args.push(end.map(|d| d.to_rfc3339()));
            }
            if let Some(max) = &patch.max_occurrences {
                sets.push("max_occurrences = ?");
                args.push(max.map(|m| m.to_string()));
            }
            if let Some(enabled) = patch.enabled {
                sets.push("enabled = ?");
                args.push(Some(if enabled { "1".into() } else { "0".into() }));
            }

            args.push(Some(id.to_string()));
            let sql = format!(
                "UPDATE recurrence_rules SET {} WHERE id = ?",
                sets.join(", ")
            );
            conn.execute(&sql, rusqlite::params_from_iter(args.iter()))
                .context("Failed to update rule")
        })?;

        if changed == 0 {
            return Ok(None);
        }
        self.find_rule(id)
    }

    /// Soft-delete: the rule row survives for history, but never fires.
    pub fn disable_rule(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE recurrence_rules SET enabled = 0, updated_at = ?2 WHERE id = ?1",
                    params![id, Utc::now().to_rfc3339()],
                )
                .context("Failed to disable rule")?;
            Ok(changed == 1)
        })
    }

    /// One firing of a rule: create the produced intent, bump the counter,
    /// stamp `last_fired_at`, and auto-disable at the occurrence limit.
    /// All in a single transaction. Returns the updated rule.
    pub fn record_rule_firing(
        &self,
        rule: &RecurrenceRule,
        intent: &Intent,
        fired_at: DateTime<Utc>,
    ) -> Result<RecurrenceRule> {
        self.with_tx(|tx| {
            insert_tx(tx, intent)?;

            let new_count = rule.occurrence_count + 1;
            let disable = rule.max_occurrences.is_some_and(|max| new_count >= max);
            tx.execute(
                "UPDATE recurrence_rules
                 SET occurrence_count = ?2, last_fired_at = ?3, updated_at = ?3,
                     enabled = CASE WHEN ?4 THEN 0 ELSE enabled END
                 WHERE id = ?1",
                params![rule.id, new_count, fired_at.to_rfc3339(), disable],
            )
            .context("Failed to record rule firing")?;
            Ok(())
        })?;

        self.find_rule(&rule.id)?
            .with_context(|| format!("Rule {} vanished during firing", rule.id))
    }
}
