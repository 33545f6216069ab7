//! Durable state store.
//!
//! A single SQLite database owns every durable record: contacts, intents,
//! recurrence rules, the credential vault table, and the job runtime's
//! queue. Writers serialize on the connection mutex; multi-row mutations go
//! through explicit transactions so partial writes are never observable.
//!
//! Timestamps are stored as RFC3339 TEXT in UTC.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

pub mod intents;
pub mod rules;

pub use intents::{Intent, IntentFilter, IntentStatus, MediaKind, MediaRef, PhoneMode, Recipient};
pub use rules::{RecurrenceRule, RuleKind};

/// Vault-table key for the primary session credential blob.
pub const CREDS_KEY: &str = "creds";

/// Shared handle to the database. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to set SQLite pragmas")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contacts (
                id                        TEXT PRIMARY KEY,
                phone                     TEXT NOT NULL UNIQUE,
                name                      TEXT,
                birthday                  TEXT,
                birthday_reminder_enabled INTEGER NOT NULL DEFAULT 1,
                created_at                TEXT NOT NULL,
                updated_at                TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recurrence_rules (
                id               TEXT PRIMARY KEY,
                contact_id       TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                kind             TEXT NOT NULL,
                content          TEXT NOT NULL DEFAULT '',
                media_url        TEXT,
                media_kind       TEXT,
                cron_expression  TEXT,
                every_n_days     INTEGER,
                end_date         TEXT,
                max_occurrences  INTEGER,
                occurrence_count INTEGER NOT NULL DEFAULT 0,
                enabled          INTEGER NOT NULL DEFAULT 1,
                last_fired_at    TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                CHECK ((cron_expression IS NULL) != (every_n_days IS NULL)),
                CHECK ((media_url IS NULL) = (media_kind IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_rules_contact ON recurrence_rules(contact_id);
            CREATE INDEX IF NOT EXISTS idx_rules_kind ON recurrence_rules(kind);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_birthday_unique
                ON recurrence_rules(contact_id) WHERE kind = 'birthday';

            CREATE TABLE IF NOT EXISTS intents (
                id                  TEXT PRIMARY KEY,
                contact_id          TEXT REFERENCES contacts(id) ON DELETE CASCADE,
                group_id            TEXT,
                content             TEXT NOT NULL DEFAULT '',
                media_url           TEXT,
                media_kind          TEXT,
                scheduled_at        TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'pending',
                provider_message_id TEXT,
                sent_at             TEXT,
                delivered_at        TEXT,
                failed_at           TEXT,
                failure_reason      TEXT,
                attempts            INTEGER NOT NULL DEFAULT 0,
                recurrence_rule_id  TEXT REFERENCES recurrence_rules(id) ON DELETE SET NULL,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                CHECK ((contact_id IS NULL) != (group_id IS NULL)),
                CHECK ((media_url IS NULL) = (media_kind IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_intents_status ON intents(status);
            CREATE INDEX IF NOT EXISTS idx_intents_scheduled_at ON intents(scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_intents_provider_msg ON intents(provider_message_id);
            CREATE INDEX IF NOT EXISTS idx_intents_contact ON intents(contact_id);

            CREATE TABLE IF NOT EXISTS credential_vault (
                key        TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_id     TEXT PRIMARY KEY,
                kind       TEXT NOT NULL,
                payload    TEXT NOT NULL,
                run_at     TEXT NOT NULL,
                status     TEXT NOT NULL DEFAULT 'queued',
                attempts   INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_run_at ON jobs(status, run_at);

            CREATE TABLE IF NOT EXISTS schedules (
                schedule_id TEXT PRIMARY KEY,
                spec        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                next_run    TEXT NOT NULL,
                end_date    TEXT,
                remaining   INTEGER,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run);",
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Run a closure against the live connection. Writers serialize here.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction; commits on `Ok`, rolls back on
    /// `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }

    // ── Credential vault table ────────────────────────────────────

    pub fn put_credential(&self, key: &str, ciphertext: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credential_vault (key, ciphertext, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET ciphertext = ?2, updated_at = ?3",
                params![key, ciphertext, Utc::now().to_rfc3339()],
            )
            .context("Failed to upsert credential row")?;
            Ok(())
        })
    }

    pub fn get_credential(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT ciphertext FROM credential_vault WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read credential row")
        })
    }

    pub fn delete_credential(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM credential_vault WHERE key = ?1", params![key])
                .context("Failed to delete credential row")?;
            Ok(())
        })
    }

    /// Wipe every credential row. Used on permanent logout.
    pub fn clear_credentials(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM credential_vault", [])
                .context("Failed to clear credential vault")?;
            Ok(())
        })
    }
}

// ── Row helpers shared by the query modules ───────────────────────

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn parse_opt_rfc3339(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        Some(raw) => Ok(Some(parse_rfc3339(&raw)?)),
        None => Ok(None),
    }
}
