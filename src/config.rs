use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Data directory holding the SQLite database and the vault key file.
    /// Computed at load time, not serialized.
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub recurrence: RecurrenceConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

// ── Rate limiting ─────────────────────────────────────────────────

/// Daily send cap. The cap counts terminal-success intents inside the
/// current IST day and cannot be disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
    /// Percentage of the cap at which a warning event fires.
    #[serde(default = "default_warn_pct")]
    pub warn_pct: u32,
}

fn default_daily_cap() -> u32 {
    30
}

fn default_warn_pct() -> u32 {
    80
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_cap: default_daily_cap(),
            warn_pct: default_warn_pct(),
        }
    }
}

// ── Pacing ────────────────────────────────────────────────────────

/// Inter-send pacing. The dispatcher sleeps a uniform random duration in
/// `[min_delay_ms, max_delay_ms)` after every send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    4_000
}

fn default_max_delay_ms() -> u64 {
    11_000
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ── Connection manager ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Base reconnect delay, doubled per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Upper bound on a single reconnect delay.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Give up the current attempt stream and re-pair after this long
    /// without a successful connect.
    #[serde(default = "default_max_retry_window_secs")]
    pub max_retry_window_secs: u64,
}

fn default_reconnect_base_ms() -> u64 {
    2_000
}

fn default_reconnect_max_ms() -> u64 {
    120_000
}

fn default_max_retry_window_secs() -> u64 {
    30 * 60
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_retry_window_secs: default_max_retry_window_secs(),
        }
    }
}

// ── Retention ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Terminal intents older than this many days are swept. 0 disables.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

// ── Recurrence ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    /// Hour of day (0-23) used for rules that don't carry their own time,
    /// birthday reminders included.
    #[serde(default = "default_send_hour")]
    pub default_send_hour: u32,
    /// Template for birthday reminders. `{{name}}` is substituted with the
    /// contact name.
    #[serde(default = "default_birthday_message")]
    pub birthday_message: String,
}

fn default_send_hour() -> u32 {
    9
}

fn default_birthday_message() -> String {
    "Happy Birthday {{name}}! Wishing you a wonderful year ahead.".to_string()
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            default_send_hour: default_send_hour(),
            birthday_message: default_birthday_message(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8321
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Which chat transport to use. The built-in `loopback` transport is a
    /// development socket that pairs instantly and acks its own sends; real
    /// wire adapters implement `ChatTransport` and register under their own
    /// name.
    #[serde(default = "default_transport")]
    pub kind: String,
}

fn default_transport() -> String {
    "loopback".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist. `data_dir` is always the file's parent directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Self::default()
        };
        config.data_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chatpace.db")
    }

    pub fn vault_key_path(&self) -> PathBuf {
        self.data_dir.join(".vault_key")
    }
}
