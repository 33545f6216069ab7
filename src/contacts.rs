//! Contact resolution.
//!
//! The scheduling core only needs a narrow surface: resolve a contact by
//! id, or by phone number with auto-creation for numbers it has never seen.
//! Everything else about contacts (CSV ingest, labels, dedup UI) lives
//! outside the core behind this trait.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::{parse_rfc3339, Store};

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    /// Digits only, country code included.
    pub phone: String,
    pub name: Option<String>,
    /// Birthday as "MM-DD".
    pub birthday: Option<String>,
    pub birthday_reminder_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait ContactStore: Send + Sync {
    fn find_contact(&self, id: &str) -> Result<Option<Contact>>;

    /// Resolve by phone, creating the contact when unknown. A provided name
    /// backfills a contact that has none; it never overwrites an existing
    /// name.
    fn resolve_or_create_by_phone(&self, phone: &str, name: Option<&str>) -> Result<Contact>;
}

/// Normalize a phone number to digits with a country code. Ten-digit local
/// numbers get the default country prefix.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        format!("91{digits}")
    } else {
        digits
    }
}

fn map_row(row: &Row) -> rusqlite::Result<(String, String, Option<String>, Option<String>, bool, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn from_raw(
    raw: (String, String, Option<String>, Option<String>, bool, String, String),
) -> Result<Contact> {
    Ok(Contact {
        id: raw.0,
        phone: raw.1,
        name: raw.2,
        birthday: raw.3,
        birthday_reminder_enabled: raw.4,
        created_at: parse_rfc3339(&raw.5)?,
        updated_at: parse_rfc3339(&raw.6)?,
    })
}

const CONTACT_COLUMNS: &str =
    "id, phone, name, birthday, birthday_reminder_enabled, created_at, updated_at";

impl ContactStore for Store {
    fn find_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                    params![id],
                    map_row,
                )
                .optional()
                .context("Failed to query contact")?;
            raw.map(from_raw).transpose()
        })
    }

    fn resolve_or_create_by_phone(&self, phone: &str, name: Option<&str>) -> Result<Contact> {
        let phone = normalize_phone(phone);
        anyhow::ensure!(!phone.is_empty(), "Phone number has no digits");

        let existing = self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = ?1"),
                    params![phone],
                    map_row,
                )
                .optional()
                .context("Failed to query contact by phone")?;
            raw.map(from_raw).transpose()
        })?;

        if let Some(contact) = existing {
            // Backfill a missing name, never overwrite.
            if contact.name.is_none() {
                if let Some(name) = name {
                    self.with_conn(|conn| {
                        conn.execute(
                            "UPDATE contacts SET name = ?2, updated_at = ?3 WHERE id = ?1",
                            params![contact.id, name, Utc::now().to_rfc3339()],
                        )?;
                        Ok(())
                    })?;
                    return self
                        .find_contact(&contact.id)?
                        .context("Contact vanished during name backfill");
                }
            }
            return Ok(contact);
        }

        let now = Utc::now();
        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            phone: phone.clone(),
            name: name.map(str::to_string),
            birthday: None,
            birthday_reminder_enabled: true,
            created_at: now,
            updated_at: now,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (id, phone, name, birthday, birthday_reminder_enabled,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, 1, ?4, ?4)",
                params![contact.id, contact.phone, contact.name, now.to_rfc3339()],
            )
            .context("Failed to create contact")?;
            Ok(())
        })?;
        Ok(contact)
    }
}

impl Store {
    /// Test/tooling helper: set the birthday fields the reminder sync reads.
    pub fn set_contact_birthday(
        &self,
        contact_id: &str,
        birthday: Option<&str>,
        reminder_enabled: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE contacts
                 SET birthday = ?2, birthday_reminder_enabled = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    contact_id,
                    birthday,
                    reminder_enabled,
                    Utc::now().to_rfc3339()
                ],
            )?;
            anyhow::ensure!(changed == 1, "Contact '{contact_id}' not found");
            Ok(())
        })
    }
}
